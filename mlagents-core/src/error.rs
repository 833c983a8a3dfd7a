//! Errors in the library.
use std::path::PathBuf;
use thiserror::Error;

/// Errors in the library.
#[derive(Error, Debug)]
pub enum MlAgentsError {
    /// Invalid or inconsistent configuration.
    #[error("Configuration error: {0}")]
    Config(String),

    /// A required hyperparameter was not given.
    #[error("The hyperparameter {key} could not be found for the {trainer} trainer of brain {brain}")]
    MissingHyperparameter {
        key: String,
        trainer: String,
        brain: String,
    },

    /// The demonstration file was written with an API version this library cannot read.
    #[error("Can't load demonstration data from an unsupported version ({0})")]
    UnsupportedDemoVersion(i32),

    /// The demonstration path does not exist.
    #[error("The demonstration file or directory {0:?} does not exist")]
    DemoNotFound(PathBuf),

    /// The demonstration path exists but is not a `.demo` file.
    #[error("The path {0:?} is not a '.demo' file")]
    InvalidDemoPath(PathBuf),

    /// Demonstrations do not match the policy they are used with.
    #[error("Demonstration mismatch: {0}")]
    DemoSpecMismatch(String),

    /// A buffer field was requested but never written.
    #[error("Buffer key {0} is missing")]
    BufferKeyMissing(String),

    /// Buffer fields have different lengths.
    #[error("Buffer field {key} has length {actual}, expected {expected}")]
    BufferLengthMismatch {
        key: String,
        expected: usize,
        actual: usize,
    },

    /// Non-blocking read from an empty queue.
    #[error("Queue is empty")]
    QueueEmpty,

    /// The other side of a queue was dropped.
    #[error("Queue for {0} is disconnected")]
    QueueDisconnected(String),

    /// A record has no value for the key.
    #[error("Record key error: {0}")]
    RecordKeyError(String),

    /// A record value has a different type than requested.
    #[error("Record value type error: {0}")]
    RecordValueTypeError(String),

    /// Malformed bytes.
    #[error("Decode error: {0}")]
    Decode(String),
}
