use nova_jdwp::{
    JdwpError, ObjectId, ERROR_ABSENT_INFORMATION, ERROR_ALREADY_INVOKING, ERROR_DUPLICATE,
    ERROR_ILLEGAL_ARGUMENT, ERROR_INTERNAL, ERROR_INVALID_CLASS, ERROR_INVALID_EVENT_TYPE,
    ERROR_INVALID_FIELDID, ERROR_INVALID_FRAMEID, ERROR_INVALID_LOCATION, ERROR_INVALID_METHODID,
    ERROR_INVALID_OBJECT, ERROR_INVALID_SLOT, ERROR_INVALID_TAG, ERROR_INVALID_THREAD,
    ERROR_NOT_IMPLEMENTED, ERROR_NO_MORE_FRAMES, ERROR_OUT_OF_MEMORY, ERROR_THREAD_NOT_ALIVE,
    ERROR_THREAD_NOT_SUSPENDED, ERROR_THREAD_SUSPENDED, ERROR_TYPE_MISMATCH, ERROR_VM_DEAD,
};
use thiserror::Error;

use crate::config::ConfigError;

pub type AgentResult<T> = Result<T, AgentError>;

#[derive(Error, Debug)]
pub enum AgentError {
    // Protocol errors: reported to the debugger, the session keeps going.
    #[error("invalid object id {0}")]
    InvalidObject(ObjectId),
    #[error("invalid thread id {0}")]
    InvalidThread(ObjectId),
    #[error("invalid reference type id {0}")]
    InvalidClass(u64),
    #[error("invalid method id {0}")]
    InvalidMethodId(u64),
    #[error("invalid field id {0}")]
    InvalidFieldId(u64),
    #[error("invalid frame id {0}")]
    InvalidFrameId(u64),
    #[error("invalid local variable slot {0}")]
    InvalidSlot(u32),
    #[error("invalid code location")]
    InvalidLocation,
    #[error("unsupported event kind {0}")]
    InvalidEventType(u8),
    #[error("type mismatch")]
    TypeMismatch,
    #[error("illegal argument: {0}")]
    IllegalArgument(String),
    #[error("information not available")]
    AbsentInformation,
    #[error("not implemented: {0}")]
    NotImplemented(String),
    #[error("duplicate request")]
    Duplicate,
    #[error("thread has no frames")]
    NoMoreFrames,
    #[error("malformed command: {0}")]
    Codec(#[from] JdwpError),

    // Suspension errors.
    #[error("thread is not suspended")]
    ThreadNotSuspended,
    #[error("thread is suspended more than once")]
    ThreadSuspended,
    #[error("thread is no longer alive")]
    ThreadNotAlive,
    #[error("timed out waiting for thread suspension")]
    Timeout,

    // Consistency violations.
    #[error("thread is already running an invocation")]
    AlreadyInvoking,
    #[error("internal error: {0}")]
    Internal(String),

    #[error("out of memory: {0}")]
    OutOfMemory(String),
    #[error("no debug session attached")]
    VmDead,

    // Startup and transport failures; never sent as a reply code.
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("transport i/o: {0}")]
    Io(#[from] std::io::Error),
}

impl AgentError {
    /// The JDWP error code sent back in the reply header.
    pub fn error_code(&self) -> u16 {
        match self {
            AgentError::InvalidObject(_) => ERROR_INVALID_OBJECT,
            AgentError::InvalidThread(_) => ERROR_INVALID_THREAD,
            AgentError::InvalidClass(_) => ERROR_INVALID_CLASS,
            AgentError::InvalidMethodId(_) => ERROR_INVALID_METHODID,
            AgentError::InvalidFieldId(_) => ERROR_INVALID_FIELDID,
            AgentError::InvalidFrameId(_) => ERROR_INVALID_FRAMEID,
            AgentError::InvalidSlot(_) => ERROR_INVALID_SLOT,
            AgentError::InvalidLocation => ERROR_INVALID_LOCATION,
            AgentError::InvalidEventType(_) => ERROR_INVALID_EVENT_TYPE,
            AgentError::TypeMismatch => ERROR_TYPE_MISMATCH,
            AgentError::IllegalArgument(_) => ERROR_ILLEGAL_ARGUMENT,
            AgentError::AbsentInformation => ERROR_ABSENT_INFORMATION,
            AgentError::NotImplemented(_) => ERROR_NOT_IMPLEMENTED,
            AgentError::Duplicate => ERROR_DUPLICATE,
            AgentError::NoMoreFrames => ERROR_NO_MORE_FRAMES,
            AgentError::Codec(JdwpError::InvalidTag(_)) => ERROR_INVALID_TAG,
            AgentError::Codec(_) => ERROR_ILLEGAL_ARGUMENT,
            AgentError::ThreadNotSuspended => ERROR_THREAD_NOT_SUSPENDED,
            AgentError::ThreadSuspended => ERROR_THREAD_SUSPENDED,
            AgentError::ThreadNotAlive => ERROR_THREAD_NOT_ALIVE,
            AgentError::AlreadyInvoking => ERROR_ALREADY_INVOKING,
            AgentError::OutOfMemory(_) => ERROR_OUT_OF_MEMORY,
            AgentError::VmDead => ERROR_VM_DEAD,
            AgentError::Timeout
            | AgentError::Internal(_)
            | AgentError::Config(_)
            | AgentError::Io(_) => ERROR_INTERNAL,
        }
    }
}

/// Report a consistency violation: loud in debug builds, logged and surfaced as
/// [`AgentError::Internal`] otherwise.
#[track_caller]
pub(crate) fn consistency_violation(message: String) -> AgentError {
    tracing::error!(target = "nova.jdwp", %message, "debug agent consistency violation");
    debug_assert!(false, "{message}");
    AgentError::Internal(message)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn suspension_errors_have_distinct_codes() {
        assert_eq!(AgentError::ThreadNotAlive.error_code(), 15);
        assert_eq!(AgentError::ThreadNotSuspended.error_code(), 13);
        assert_eq!(AgentError::Timeout.error_code(), 113);
        assert_eq!(AgentError::AlreadyInvoking.error_code(), 502);
    }

    #[test]
    fn codec_errors_map_to_tag_or_argument_codes() {
        assert_eq!(
            AgentError::from(JdwpError::InvalidTag(b'?')).error_code(),
            ERROR_INVALID_TAG
        );
        assert_eq!(
            AgentError::from(JdwpError::Protocol("short".into())).error_code(),
            ERROR_ILLEGAL_ARGUMENT
        );
    }
}
