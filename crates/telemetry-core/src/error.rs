//! Error types for declaration loading, transformation, scheduling and fetch.

/// Errors raised while loading or compiling a declaration.
///
/// These are produced before any asynchronous work starts.
#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum DeclarationError {
    #[error("Invalid property '{name}': {message}")]
    InvalidProperty { name: String, message: String },

    #[error("Unknown conditional function: {0}")]
    UnknownConditional(String),

    #[error("Unknown custom function: {0}")]
    UnknownFunction(String),

    #[error("Invalid filter: {0}")]
    InvalidFilter(String),

    #[error("Invalid data action #{index}: {message}")]
    InvalidAction { index: usize, message: String },

    #[error("Invalid declaration: {0}")]
    Invalid(String),
}

/// Errors raised by the normalization pipeline for a single property.
#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum TransformError {
    #[error("Unable to find key '{0}' in data")]
    KeyNotFound(String),

    #[error("convertArrayToMap: array element missing key '{0}'")]
    MissingArrayKey(String),

    #[error("Function '{name}' failed: {message}")]
    Function { name: String, message: String },

    #[error("Invalid data: {0}")]
    InvalidData(String),
}

/// Errors returned by the task queue.
#[derive(thiserror::Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulerError {
    #[error("Task queue is full (max size {0})")]
    QueueFull(usize),

    #[error("Task queue is stopped")]
    Stopped,

    #[error("Worker not found: {0}")]
    WorkerNotFound(usize),

    #[error("No Tokio runtime available to run tasks")]
    NoRuntime,
}

/// Errors returned by an endpoint loader.
#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum LoadError {
    #[error("Endpoint not found: {0}")]
    NotFound(String),

    #[error("Endpoint '{endpoint}' failed: {message}")]
    Failed { endpoint: String, message: String },

    #[error("Endpoint '{0}' timed out")]
    Timeout(String),
}

/// Top-level error for the collection engine.
#[derive(thiserror::Error, Debug)]
pub enum TelemetryError {
    #[error(transparent)]
    Declaration(#[from] DeclarationError),

    #[error(transparent)]
    Transform(#[from] TransformError),

    #[error(transparent)]
    Scheduler(#[from] SchedulerError),

    #[error(transparent)]
    Load(#[from] LoadError),
}

/// Convenience result type.
pub type TelemetryResult<T> = Result<T, TelemetryError>;
