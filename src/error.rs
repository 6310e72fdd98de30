//! Engine error types.
//!
//! One typed error enum covers the failure classes the engine distinguishes:
//! configuration mistakes fail the originating command synchronously, plugin
//! failures surface up the actor hierarchy, protocol violations are logged
//! and dropped at leaf level, transport failures abort cluster setup, and
//! aggregator shape mismatches are treated like plugin failures.

use snafu::Snafu;

/// Errors produced by the engine.
#[derive(Debug, Snafu)]
pub enum EngineError {
    /// Invalid cluster or job configuration.
    #[snafu(display("invalid configuration: {message}"))]
    Config {
        /// What was wrong with the configuration.
        message: String,
    },

    /// User plugin code returned a failure.
    #[snafu(display("plugin error: {message}"))]
    Plugin {
        /// Rendered plugin error.
        message: String,
    },

    /// A command or acknowledgement that violates the superstep protocol.
    #[snafu(display("protocol violation: {message}"))]
    Protocol {
        /// Description of the violation.
        message: String,
    },

    /// Actor messaging or remote-worker attachment failed.
    #[snafu(display("transport error: {message}"))]
    Transport {
        /// Description of the transport failure.
        message: String,
    },

    /// An aggregator value had the wrong runtime shape or an unknown name.
    #[snafu(display("aggregator {name}: {message}"))]
    Aggregator {
        /// Aggregator name involved.
        name: String,
        /// Description of the mismatch.
        message: String,
    },
}

impl EngineError {
    /// Wrap an error coming out of user plugin code.
    pub fn plugin(err: anyhow::Error) -> Self {
        EngineError::Plugin {
            message: format!("{err:#}"),
        }
    }
}

/// Engine result alias.
pub type Result<T, E = EngineError> = std::result::Result<T, E>;
