use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug, Clone)]
pub enum Error {
    #[error("Supplier Error - {0}")]
    Supplier(String),

    #[error("Runner Error - {0}")]
    Runner(String),

    #[error("Supervisor Error - {0}")]
    Supervisor(String),

    #[error("Metadata Error - {0}")]
    Metadata(String),

    #[error("Config Error - {0}")]
    Config(String),

    #[error("Persist Error - {0}")]
    Persist(String),

    #[error("Driver Error - {0}")]
    Driver(String),

    #[error("Parse Error - {0}")]
    Parse(String),

    #[error("Starting sequence [{start}] is no longer available for partition [{partition}] (earliest: [{earliest}])")]
    StartSequenceUnavailable {
        partition: String,
        start: String,
        earliest: String,
    },

    #[error("Transaction failure publishing segments for sequence [{0}]")]
    PublishTransaction(String),

    #[error("Max parse exceptions exceeded, terminating task")]
    MaxParseExceptionsExceeded,

    #[error("OneShot Receiver Error - {0}")]
    ActorPatternRecv(String),

    #[error("Task stopped without publishing")]
    StoppedWithoutPublishing,
}

impl From<silt_kafka::Error> for Error {
    fn from(value: silt_kafka::Error) -> Self {
        Error::Supplier(value.to_string())
    }
}

impl From<silt_kinesis::Error> for Error {
    fn from(value: silt_kinesis::Error) -> Self {
        match value {
            silt_kinesis::Error::Closed => Error::Supplier("supplier already closed".to_string()),
            other => Error::Supplier(other.to_string()),
        }
    }
}
