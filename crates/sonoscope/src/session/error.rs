use sonoconf::ConfigError;
use thiserror::Error;

use super::SessionState;
use crate::buffer::BufferError;
use crate::hardware::CoreError;
use crate::kernels::KernelError;
use crate::ops::SequenceKind;
use crate::processing::ProcessingError;

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("session is closed")]
    SessionClosed,

    #[error("no scheme uploaded")]
    NotUploaded,

    #[error("scheme is not running")]
    NotRunning,

    #[error("device not found: {0}")]
    DeviceNotFound(String),

    #[error("no kernel for {0}")]
    UnsupportedSequence(SequenceKind),

    #[error("invalid scheme: {0}")]
    InvalidScheme(String),

    #[error("buffer overflow at element {position}")]
    BufferOverflow { position: usize },

    #[error("cannot {operation} while {state}")]
    InvalidState {
        state: SessionState,
        operation: &'static str,
    },

    #[error("previous processing is still running; stop the scheme first")]
    ProcessingActive,

    #[error(transparent)]
    Kernel(KernelError),

    #[error("hardware core: {0}")]
    Hardware(CoreError),

    #[error(transparent)]
    Buffer(BufferError),

    #[error(transparent)]
    Processing(#[from] ProcessingError),

    #[error(transparent)]
    Config(#[from] ConfigError),
}

impl From<KernelError> for SessionError {
    fn from(err: KernelError) -> Self {
        match err {
            KernelError::UnsupportedSequence(kind) => Self::UnsupportedSequence(kind),
            other => Self::Kernel(other),
        }
    }
}

impl From<BufferError> for SessionError {
    fn from(err: BufferError) -> Self {
        match err {
            BufferError::Overflow { position } => Self::BufferOverflow { position },
            other => Self::Buffer(other),
        }
    }
}

impl From<CoreError> for SessionError {
    fn from(err: CoreError) -> Self {
        match err {
            CoreError::DeviceNotFound(path) => Self::DeviceNotFound(path),
            CoreError::NotUploaded => Self::NotUploaded,
            CoreError::Buffer(err) => err.into(),
            other => Self::Hardware(other),
        }
    }
}
