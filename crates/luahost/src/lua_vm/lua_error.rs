use std::any::Any;
use std::error::Error as StdError;
use std::ffi::c_int;
use std::fmt;
use std::io;
use std::sync::Arc;

use crate::ffi;

/// Status code of a protected call, `lua_resume` or `lua_load`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LuaStatus {
    Ok,
    Yield,
    /// `LUA_ERRRUN`
    Runtime,
    /// `LUA_ERRSYNTAX`
    Syntax,
    /// `LUA_ERRMEM`
    Memory,
    /// `LUA_ERRERR`: error while running the message handler.
    MessageHandler,
    /// `LUA_ERRFILE`
    File,
}

impl LuaStatus {
    pub fn from_code(code: c_int) -> Option<Self> {
        match code {
            ffi::LUA_OK => Some(LuaStatus::Ok),
            ffi::LUA_YIELD => Some(LuaStatus::Yield),
            ffi::LUA_ERRRUN => Some(LuaStatus::Runtime),
            ffi::LUA_ERRSYNTAX => Some(LuaStatus::Syntax),
            ffi::LUA_ERRMEM => Some(LuaStatus::Memory),
            ffi::LUA_ERRERR => Some(LuaStatus::MessageHandler),
            ffi::LUA_ERRFILE => Some(LuaStatus::File),
            _ => None,
        }
    }

    pub fn code(self) -> c_int {
        match self {
            LuaStatus::Ok => ffi::LUA_OK,
            LuaStatus::Yield => ffi::LUA_YIELD,
            LuaStatus::Runtime => ffi::LUA_ERRRUN,
            LuaStatus::Syntax => ffi::LUA_ERRSYNTAX,
            LuaStatus::Memory => ffi::LUA_ERRMEM,
            LuaStatus::MessageHandler => ffi::LUA_ERRERR,
            LuaStatus::File => ffi::LUA_ERRFILE,
        }
    }

    pub fn is_error(self) -> bool {
        !matches!(self, LuaStatus::Ok | LuaStatus::Yield)
    }
}

impl fmt::Display for LuaStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            LuaStatus::Ok => "LUA_OK",
            LuaStatus::Yield => "LUA_YIELD",
            LuaStatus::Runtime => "LUA_ERRRUN",
            LuaStatus::Syntax => "LUA_ERRSYNTAX",
            LuaStatus::Memory => "LUA_ERRMEM",
            LuaStatus::MessageHandler => "LUA_ERRERR",
            LuaStatus::File => "LUA_ERRFILE",
        };
        f.write_str(name)
    }
}

/// Every failure the binding reports.
///
/// Errors raised by host callbacks keep their identity across the
/// interpreter: a callback returning `LuaError::External(e)` surfaces at the
/// enclosing protected boundary as the very same `Arc`.
#[derive(Debug, Clone, thiserror::Error)]
pub enum LuaError {
    /// The script raised an error during a protected call.
    #[error("runtime error: {message}")]
    Runtime { message: String, status: LuaStatus },

    /// The chunk failed to compile.
    #[error("syntax error: {0}")]
    Syntax(String),

    /// Fatal interpreter condition: allocation failure or an error inside the
    /// message handler.
    #[error("interpreter panic ({status}): {message}")]
    Panic { message: String, status: LuaStatus },

    /// A value could not be converted in the requested direction.
    #[error("marshal error: {0}")]
    Marshal(String),

    /// An argument was rejected before touching the interpreter.
    #[error("bad argument: {0}")]
    Argument(String),

    /// Ownership, capacity or registration failure.
    #[error("invalid operation: {0}")]
    InvalidOperation(String),

    #[error("object disposed: {0}")]
    ObjectDisposed(&'static str),

    #[error("stack index {index} out of range (count {count})")]
    IndexOutOfRange { index: c_int, count: c_int },

    /// Execution interrupted by [`ExecutionLimits`](super::ExecutionLimits).
    #[error("execution cancelled: {0}")]
    Cancelled(String),

    #[error("the interpreter state is closed")]
    StateClosed,

    #[error("interpreter version mismatch: expected {expected}, found {found}")]
    VersionMismatch { expected: f64, found: f64 },

    #[error("io error: {0}")]
    Io(Arc<io::Error>),

    /// Error produced by host code, preserved as-is.
    #[error(transparent)]
    External(Arc<dyn StdError + Send + Sync>),

    /// A userdata value is already borrowed in an incompatible way.
    #[error("userdata `{0}` is already borrowed")]
    BorrowConflict(String),
}

pub type LuaResult<T> = Result<T, LuaError>;

impl LuaError {
    /// Wrap a host error so it survives a round trip through the interpreter.
    pub fn external<E>(err: E) -> Self
    where
        E: Into<Box<dyn StdError + Send + Sync>>,
    {
        LuaError::External(Arc::from(err.into()))
    }

    pub fn runtime(message: impl Into<String>) -> Self {
        LuaError::Runtime {
            message: message.into(),
            status: LuaStatus::Runtime,
        }
    }

    /// Build the error for a failed protected call from its status code and
    /// message.
    pub(crate) fn from_status(status: c_int, message: String) -> Self {
        let message = normalize_newlines(message);
        match LuaStatus::from_code(status) {
            Some(LuaStatus::Syntax) => LuaError::Syntax(message),
            Some(status @ (LuaStatus::Memory | LuaStatus::MessageHandler)) => {
                LuaError::Panic { message, status }
            }
            Some(status @ LuaStatus::File) => LuaError::Runtime { message, status },
            _ => LuaError::Runtime {
                message,
                status: LuaStatus::Runtime,
            },
        }
    }

    /// Status code carried by interpreter-sourced errors.
    pub fn status(&self) -> Option<LuaStatus> {
        match self {
            LuaError::Runtime { status, .. } | LuaError::Panic { status, .. } => Some(*status),
            LuaError::Syntax(_) => Some(LuaStatus::Syntax),
            _ => None,
        }
    }

    pub fn is_fatal(&self) -> bool {
        matches!(self, LuaError::Panic { .. })
    }

    /// Downcast the host error inside `External`.
    pub fn downcast_ref<E: StdError + 'static>(&self) -> Option<&E> {
        match self {
            LuaError::External(err) => err.downcast_ref::<E>(),
            _ => None,
        }
    }

    pub(crate) fn disposed(what: &'static str) -> Self {
        LuaError::ObjectDisposed(what)
    }

    pub(crate) fn foreign_owner(what: &str) -> Self {
        LuaError::InvalidOperation(format!("{what} is owned by a different state"))
    }

    pub(crate) fn type_mismatch(expected: &str, found: &str) -> Self {
        LuaError::Marshal(format!("expected {expected}, got {found}"))
    }
}

impl From<io::Error> for LuaError {
    fn from(err: io::Error) -> Self {
        LuaError::Io(Arc::new(err))
    }
}

impl From<String> for LuaError {
    fn from(message: String) -> Self {
        LuaError::runtime(message)
    }
}

impl From<&str> for LuaError {
    fn from(message: &str) -> Self {
        LuaError::runtime(message)
    }
}

impl From<std::str::Utf8Error> for LuaError {
    fn from(err: std::str::Utf8Error) -> Self {
        LuaError::Marshal(format!("invalid utf-8: {err}"))
    }
}

/// Convert `\r\n` and lone `\r` to `\n`.
pub(crate) fn normalize_newlines(message: String) -> String {
    if !message.contains('\r') {
        return message;
    }
    message.replace("\r\n", "\n").replace('\r', "\n")
}

/// Best-effort text of a panic payload.
pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&'static str>() {
        (*s).to_owned()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "rust panic".to_owned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, thiserror::Error)]
    #[error("boom {0}")]
    struct Boom(u32);

    #[test]
    fn test_external_downcast() {
        let err = LuaError::external(Boom(7));
        assert_eq!(err.downcast_ref::<Boom>().map(|b| b.0), Some(7));
        assert_eq!(err.to_string(), "boom 7");
        assert!(err.status().is_none());
    }

    #[test]
    fn test_status_mapping() {
        let err = LuaError::from_status(ffi::LUA_ERRMEM, "not enough memory".into());
        assert!(err.is_fatal());
        assert_eq!(err.status(), Some(LuaStatus::Memory));

        let err = LuaError::from_status(ffi::LUA_ERRSYNTAX, "x".into());
        assert!(matches!(err, LuaError::Syntax(_)));

        let err = LuaError::from_status(ffi::LUA_ERRRUN, "a\r\nb\rc".into());
        match err {
            LuaError::Runtime { message, status } => {
                assert_eq!(message, "a\nb\nc");
                assert_eq!(status, LuaStatus::Runtime);
            }
            other => panic!("unexpected {other:?}"),
        }
    }
}
