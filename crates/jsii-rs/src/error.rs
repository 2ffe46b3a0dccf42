//! Error types for the jsii host runtime.
//!
//! Each variant corresponds to one failure class of the protocol client.
//! Only [`JsiiError::Kernel`] and [`JsiiError::Marshal`] leave the engine
//! usable; every other kind either prevents a start or poisons the engine.

use thiserror::Error;

/// Main error type for kernel client operations.
#[derive(Debug, Error)]
pub enum JsiiError {
    /// The kernel executable could not be located or launched.
    #[error(
        "cannot locate or launch the '{fallback}' executable \
         (checked the {env_var} override and PATH): {message}"
    )]
    EnvMisconfigured {
        env_var: String,
        fallback: String,
        message: String,
        #[source]
        source: Option<std::io::Error>,
    },

    /// The kernel announced a version this client was not built against.
    #[error("incompatible jsii-runtime version: expected {expected}, actual was {actual}")]
    IncompatibleRuntime { expected: String, actual: String },

    /// The kernel answered a request with an `error` response.
    #[error("{}", kernel_message(.message, .stack))]
    Kernel {
        message: String,
        stack: Option<String>,
    },

    /// A value could not be translated across the type-system boundary.
    #[error("marshaling error: {message}")]
    Marshal { message: String },

    /// The kernel violated the wire contract.
    #[error("protocol violation: {message}")]
    Protocol { message: String },

    /// The kernel process exited while a conversation was in progress.
    #[error("jsii-runtime exited unexpectedly: {message}")]
    KernelTerminated { message: String },

    /// The engine was poisoned by an earlier unrecoverable failure.
    #[error("engine is poisoned: {reason}")]
    Poisoned { reason: String },

    /// I/O failure on the kernel pipes.
    #[error("kernel I/O error: {message}")]
    Io {
        message: String,
        #[source]
        source: Option<std::io::Error>,
    },
}

/// Result type alias for kernel client operations.
pub type Result<T> = std::result::Result<T, JsiiError>;

fn kernel_message(message: &str, stack: &Option<String>) -> String {
    match stack {
        Some(stack) => format!("{message}\n{stack}"),
        None => message.to_string(),
    }
}

impl From<std::io::Error> for JsiiError {
    fn from(err: std::io::Error) -> Self {
        JsiiError::Io {
            message: err.to_string(),
            source: Some(err),
        }
    }
}

impl JsiiError {
    /// Shorthand for a [`JsiiError::Marshal`].
    pub fn marshal(message: impl Into<String>) -> Self {
        JsiiError::Marshal {
            message: message.into(),
        }
    }

    /// Shorthand for a [`JsiiError::Protocol`].
    pub fn protocol(message: impl Into<String>) -> Self {
        JsiiError::Protocol {
            message: message.into(),
        }
    }

    /// Whether this failure poisons the engine.
    ///
    /// Fatal errors leave the protocol in an indeterminate state; the engine
    /// refuses further traffic and the kernel is terminated. Non-fatal errors
    /// (`Kernel`, `Marshal`, `EnvMisconfigured`) leave the engine usable.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            JsiiError::IncompatibleRuntime { .. }
                | JsiiError::Protocol { .. }
                | JsiiError::KernelTerminated { .. }
                | JsiiError::Poisoned { .. }
                | JsiiError::Io { .. }
        )
    }

    /// Process exit code for the `jsii-host` CLI.
    ///
    /// 0 is reserved for clean termination; anything unclassified maps to 1.
    pub fn exit_code(&self) -> i32 {
        match self {
            JsiiError::EnvMisconfigured { .. } => 2,
            JsiiError::Protocol { .. }
            | JsiiError::KernelTerminated { .. }
            | JsiiError::Io { .. }
            | JsiiError::Poisoned { .. } => 3,
            JsiiError::IncompatibleRuntime { .. } => 4,
            _ => 1,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kernel_error_appends_stack() {
        let err = JsiiError::Kernel {
            message: "divide by zero".into(),
            stack: Some("at Calculator.div".into()),
        };
        assert_eq!(err.to_string(), "divide by zero\nat Calculator.div");
    }

    #[test]
    fn test_kernel_error_without_stack() {
        let err = JsiiError::Kernel {
            message: "divide by zero".into(),
            stack: None,
        };
        assert_eq!(err.to_string(), "divide by zero");
    }

    #[test]
    fn test_fatality_classification() {
        assert!(JsiiError::protocol("truncated line").is_fatal());
        assert!(JsiiError::KernelTerminated {
            message: "exit code 1".into()
        }
        .is_fatal());
        assert!(!JsiiError::marshal("NaN").is_fatal());
        assert!(!JsiiError::Kernel {
            message: "boom".into(),
            stack: None
        }
        .is_fatal());
    }

    #[test]
    fn test_exit_codes() {
        let spawn = JsiiError::EnvMisconfigured {
            env_var: "JSII_RUNTIME".into(),
            fallback: "jsii-runtime".into(),
            message: "not found".into(),
            source: None,
        };
        assert_eq!(spawn.exit_code(), 2);
        assert_eq!(JsiiError::protocol("bad frame").exit_code(), 3);
        let version = JsiiError::IncompatibleRuntime {
            expected: "1.2.3".into(),
            actual: "1.2.4".into(),
        };
        assert_eq!(version.exit_code(), 4);
    }
}
