//! pipesched error types

/// pipesched result type
pub type Result<T> = std::result::Result<T, Error>;

/// pipesched errors
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Invalid argument to a planner, scheduler or topology constructor
    #[error("invalid argument '{arg}': {reason}")]
    InvalidArgument {
        /// Argument name
        arg: &'static str,
        /// Why it's invalid
        reason: String,
    },

    /// Ordering violation detected while driving a schedule
    #[error("scheduler error: {reason}")]
    SchedulerError {
        /// Description of what went wrong
        reason: String,
    },

    /// Point-to-point communication error
    #[error("distributed error: {reason}")]
    DistributedError {
        /// Description of what went wrong
        reason: String,
    },

    /// Stage compute or optimizer error
    #[error("training error: {reason}")]
    TrainingError {
        /// Description of what went wrong
        reason: String,
    },

    /// Schedule configuration could not be parsed
    #[error("config error: {reason}")]
    Config {
        /// Parser message
        reason: String,
    },
}
