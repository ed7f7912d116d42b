//! Error types for the simulator binary.
//!
//! [`SimError`] wraps every failure mode during simulator startup and the
//! step loop so `main` can propagate with `?`.

/// Top-level error for the simulator.
#[derive(Debug, thiserror::Error)]
pub enum SimError {
    /// Coordinator configuration loading failed.
    #[error("config error: {source}")]
    Config {
        /// The underlying config error.
        #[from]
        source: somnus_core::config::ConfigError,
    },

    /// A coordinator operation failed.
    #[error("coordinator error: {source}")]
    Coordinator {
        /// The underlying coordinator error.
        #[from]
        source: somnus_core::coordinator::CoordinatorError,
    },

    /// The `simulation` config section is malformed.
    #[error("simulation config error: {message}")]
    Simulation {
        /// Description of the problem.
        message: String,
    },
}
