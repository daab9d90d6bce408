//! Error types for the PL/Lua handler.
//!
//! Every failure that can cross the script/database boundary is expressed as
//! an [`Error`]. Errors raised by the host or by conversion code inside a
//! script callback travel through the Lua VM as external errors and are
//! recovered intact by [`From<mlua::Error>`].

use std::fmt;

/// The result type used throughout the handler.
pub type Result<T> = std::result::Result<T, Error>;

/// Structured error record: the shape both host failures and script errors
/// take when they are reported to the database or handed to a script.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ErrorReport {
    /// Primary message.
    pub message: String,
    /// Optional detail line.
    pub detail: Option<String>,
    /// Optional hint line.
    pub hint: Option<String>,
    /// Optional context (call stack or statement).
    pub context: Option<String>,
    /// Five-character SQLSTATE, when known.
    pub code: Option<String>,
}

impl ErrorReport {
    /// Creates a report carrying only a message.
    pub fn new(message: impl Into<String>) -> Self {
        Self { message: message.into(), ..Default::default() }
    }

    /// Sets the SQLSTATE.
    pub fn with_code(mut self, code: impl Into<String>) -> Self {
        self.code = Some(code.into());
        self
    }

    /// Sets the detail line.
    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }

    /// Sets the hint line.
    pub fn with_hint(mut self, hint: impl Into<String>) -> Self {
        self.hint = Some(hint.into());
        self
    }

    /// Sets the context line.
    pub fn with_context(mut self, context: impl Into<String>) -> Self {
        self.context = Some(context.into());
        self
    }
}

impl fmt::Display for ErrorReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)?;
        if let Some(detail) = &self.detail {
            write!(f, " (detail: {})", detail)?;
        }
        Ok(())
    }
}

/// The error type for handler operations.
#[derive(Debug, Clone, thiserror::Error)]
pub enum Error {
    /// A value could not be converted to or from its declared type.
    #[error("Conversion error: {0}")]
    Conversion(String),

    /// A composed value would exceed the allocation ceiling.
    #[error("Size error: {0}")]
    Size(String),

    /// A named field does not exist in the target row layout.
    #[error("Field not found: {0}")]
    FieldNotFound(String),

    /// Routine source failed to compile.
    #[error("Compile error: {0}")]
    Compile(String),

    /// A script raised an error.
    #[error("Runtime error: {0}")]
    Runtime(ErrorReport),

    /// The host database reported a failure.
    #[error("Host fault: {0}")]
    Host(ErrorReport),

    /// A call protocol was violated (resuming a finished set, wrong call
    /// context, frames popped out of order).
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// An invalid argument was provided.
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// Unrecoverable failure. The engine instance that raised it refuses all
    /// further work.
    #[error("Fatal error: {0}")]
    Fatal(String),

    /// An internal error occurred.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Creates a new conversion error.
    pub fn conversion(msg: impl Into<String>) -> Self {
        Error::Conversion(msg.into())
    }

    /// Creates a new size error.
    pub fn size(msg: impl Into<String>) -> Self {
        Error::Size(msg.into())
    }

    /// Creates a new field-not-found error.
    pub fn field_not_found(name: impl Into<String>) -> Self {
        Error::FieldNotFound(name.into())
    }

    /// Creates a new compile error.
    pub fn compile(msg: impl Into<String>) -> Self {
        Error::Compile(msg.into())
    }

    /// Creates a new script runtime error carrying only a message.
    pub fn runtime(msg: impl Into<String>) -> Self {
        Error::Runtime(ErrorReport::new(msg))
    }

    /// Creates a new host fault carrying only a message.
    pub fn host(msg: impl Into<String>) -> Self {
        Error::Host(ErrorReport::new(msg))
    }

    /// Creates a new protocol error.
    pub fn protocol(msg: impl Into<String>) -> Self {
        Error::Protocol(msg.into())
    }

    /// Creates a new invalid argument error.
    pub fn invalid_argument(msg: impl Into<String>) -> Self {
        Error::InvalidArgument(msg.into())
    }

    /// Creates a new internal error.
    pub fn internal(msg: impl Into<String>) -> Self {
        Error::Internal(msg.into())
    }

    /// Returns true for errors that must not be caught by a protected call.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Error::Fatal(_))
    }

    /// SQLSTATE reported for this error.
    pub fn sqlstate(&self) -> &str {
        match self {
            Error::Conversion(_) => "22000",
            Error::Size(_) => "54000",
            Error::FieldNotFound(_) => "42703",
            Error::Compile(_) => "42P13",
            Error::Runtime(report) | Error::Host(report) => {
                report.code.as_deref().unwrap_or(if matches!(self, Error::Runtime(_)) {
                    "22000"
                } else {
                    "XX000"
                })
            }
            Error::Protocol(_) => "0A000",
            Error::InvalidArgument(_) => "22023",
            Error::Fatal(_) | Error::Internal(_) => "XX000",
        }
    }

    /// Renders the error as a structured report.
    pub fn report(&self) -> ErrorReport {
        match self {
            Error::Runtime(report) | Error::Host(report) => {
                let mut report = report.clone();
                report.code.get_or_insert_with(|| self.sqlstate().to_string());
                report
            }
            Error::Conversion(msg)
            | Error::Size(msg)
            | Error::Compile(msg)
            | Error::Protocol(msg)
            | Error::InvalidArgument(msg)
            | Error::Fatal(msg)
            | Error::Internal(msg) => ErrorReport::new(msg.clone()).with_code(self.sqlstate()),
            Error::FieldNotFound(name) => {
                ErrorReport::new(format!("field '{}' not found", name)).with_code(self.sqlstate())
            }
        }
    }
}

impl From<mlua::Error> for Error {
    fn from(err: mlua::Error) -> Self {
        match err {
            mlua::Error::CallbackError { cause, .. } => Error::from((*cause).clone()),
            mlua::Error::ExternalError(inner) => match inner.downcast_ref::<Error>() {
                Some(err) => err.clone(),
                None => Error::Runtime(ErrorReport::new(inner.to_string())),
            },
            mlua::Error::SyntaxError { message, .. } => Error::Compile(message),
            mlua::Error::RuntimeError(msg) => Error::Runtime(ErrorReport::new(msg)),
            mlua::Error::MemoryError(msg) => {
                Error::Runtime(ErrorReport::new(msg).with_code("53200"))
            }
            other => Error::Internal(other.to_string()),
        }
    }
}

impl From<Error> for mlua::Error {
    fn from(err: Error) -> Self {
        mlua::Error::external(err)
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Conversion(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = Error::conversion("cannot convert table to integer");
        assert_eq!(err.to_string(), "Conversion error: cannot convert table to integer");

        let err = Error::Host(ErrorReport::new("relation missing").with_detail("x"));
        assert_eq!(err.to_string(), "Host fault: relation missing (detail: x)");
    }

    #[test]
    fn test_error_sqlstate() {
        assert_eq!(Error::size("too big").sqlstate(), "54000");
        assert_eq!(Error::field_not_found("z").sqlstate(), "42703");
        assert_eq!(Error::runtime("boom").sqlstate(), "22000");
        let err = Error::Host(ErrorReport::new("dup").with_code("23505"));
        assert_eq!(err.sqlstate(), "23505");
        assert_eq!(err.report().code.as_deref(), Some("23505"));
    }

    #[test]
    fn test_error_round_trips_through_lua() {
        let original = Error::Host(ErrorReport::new("disk full").with_hint("free space"));
        let lua_err: mlua::Error = original.clone().into();
        let wrapped = mlua::Error::CallbackError {
            traceback: String::new(),
            cause: std::sync::Arc::new(lua_err),
        };
        let back = Error::from(wrapped);
        assert!(matches!(back, Error::Host(ref r) if r == &ErrorReport::new("disk full").with_hint("free space")));
    }

    #[test]
    fn test_fatal_classification() {
        assert!(Error::Fatal("double fault".into()).is_fatal());
        assert!(!Error::runtime("x").is_fatal());
    }
}
