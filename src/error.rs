use thiserror::Error;

/// Numeric control-protocol response codes.
pub const CONTROL_OK: u8 = 0;
pub const CONTROL_INVALID_REQUEST: u8 = 1;
pub const CONTROL_CONNECTION_NOT_EXIST: u8 = 2;

/// Crate-wide error type.
///
/// Replaces the Python original's habit of raising bare `IOError`/
/// `RuntimeError` and branching on `type(e).__name__ == "ControlError"`
/// with a typed sum.
#[derive(Debug, Error)]
pub enum RudpError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("control protocol error ({code}): {message}")]
    ControlProtocol { code: u8, message: String },

    #[error("resource exhausted: {0}")]
    ResourceExhausted(String),

    #[error("configuration error: {0}")]
    Config(String),
}

impl RudpError {
    pub fn invalid_request(message: impl Into<String>) -> RudpError {
        RudpError::ControlProtocol {
            code: CONTROL_INVALID_REQUEST,
            message: message.into(),
        }
    }

    pub fn connection_not_exist(message: impl Into<String>) -> RudpError {
        RudpError::ControlProtocol {
            code: CONTROL_CONNECTION_NOT_EXIST,
            message: message.into(),
        }
    }

    /// The numeric code to report on the control channel for this error,
    /// defaulting to "invalid request" the way `ControlSocket.send_error`
    /// does for any exception that isn't a `ControlError`.
    pub fn control_code(&self) -> u8 {
        match self {
            RudpError::ControlProtocol { code, .. } => *code,
            _ => CONTROL_INVALID_REQUEST,
        }
    }
}

pub type Result<T> = std::result::Result<T, RudpError>;
