use thiserror::Error;

/// Error taxonomy for the encoder.
///
/// Invalid inputs are detected before any coding work begins and never leave
/// partial output behind. Everything else is an internal fault: the current
/// chunk is discarded and session counters stay untouched. An exhausted
/// session is deliberately *not* an error; it is reported through the DONE
/// status instead.
#[derive(Error, Debug)]
pub enum Error {
    #[error("invalid input: {0}")]
    InvalidInput(String),
    #[error("internal encoding fault: {0}")]
    Fault(String),
    #[error("arithmetic coder error: {0}")]
    Coder(#[from] crate::encode::mq::MqError),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// A specialized `Result` type for encoding operations.
pub type Result<T> = std::result::Result<T, Error>;
