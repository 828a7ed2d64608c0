use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProcessError {
    #[error("Not running in desktop mode")]
    NotDesktopContext,

    /// The host rejected or could not service a command. The message is the host's own text.
    #[error("{message}")]
    HostInvocation { message: String },

    #[error("Host event transport is not available")]
    TransportUnavailable,
}

impl ProcessError {
    pub(crate) fn host(message: impl Into<String>) -> Self {
        Self::HostInvocation {
            message: message.into(),
        }
    }
}

pub type ProcessResult<T> = Result<T, ProcessError>;
