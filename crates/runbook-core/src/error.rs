//! Run error taxonomy and its script-visible form

use std::fmt;

use rhai::{Dynamic, EvalAltResult, Map, Position};
use runbook_exec::{ExecError, SecretError};
use thiserror::Error;

/// Errors that end a bridged call or a run
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RunError {
    /// Bad configuration, options or secrets file
    #[error("configuration error: {0}")]
    Configuration(String),

    /// Script failed to parse
    #[error("compile error: {0}")]
    Compile(String),

    /// Credentials rejected
    #[error("authentication failed: {0}")]
    Authentication(String),

    /// Connection or transport failure
    #[error("network error: {0}")]
    Network(String),

    /// Deadline exceeded
    #[error("timed out: {0}")]
    Timeout(String),

    /// Missing secret, file or entry point
    #[error("not found: {0}")]
    NotFound(String),

    /// Value of the wrong type
    #[error("type error: {0}")]
    Type(String),

    /// Any other failure while executing
    #[error("execution failed: {0}")]
    Execution(String),

    /// Run cancelled
    #[error("run aborted")]
    Aborted,
}

/// Error category as seen by scripts in the thrown value's `kind` field
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    Configuration,
    Compile,
    Authentication,
    Network,
    Timeout,
    NotFound,
    Type,
    Execution,
    Aborted,
}

impl ErrorKind {
    /// Script-visible name
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorKind::Configuration => "configuration",
            ErrorKind::Compile => "compile",
            ErrorKind::Authentication => "authentication",
            ErrorKind::Network => "network",
            ErrorKind::Timeout => "timeout",
            ErrorKind::NotFound => "not_found",
            ErrorKind::Type => "type",
            ErrorKind::Execution => "execution",
            ErrorKind::Aborted => "aborted",
        }
    }

    fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "configuration" => ErrorKind::Configuration,
            "compile" => ErrorKind::Compile,
            "authentication" => ErrorKind::Authentication,
            "network" => ErrorKind::Network,
            "timeout" => ErrorKind::Timeout,
            "not_found" => ErrorKind::NotFound,
            "type" => ErrorKind::Type,
            "execution" => ErrorKind::Execution,
            "aborted" => ErrorKind::Aborted,
            _ => return None,
        })
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl RunError {
    /// Build an error of `kind` carrying `message`
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        let message = message.into();
        match kind {
            ErrorKind::Configuration => RunError::Configuration(message),
            ErrorKind::Compile => RunError::Compile(message),
            ErrorKind::Authentication => RunError::Authentication(message),
            ErrorKind::Network => RunError::Network(message),
            ErrorKind::Timeout => RunError::Timeout(message),
            ErrorKind::NotFound => RunError::NotFound(message),
            ErrorKind::Type => RunError::Type(message),
            ErrorKind::Execution => RunError::Execution(message),
            ErrorKind::Aborted => RunError::Aborted,
        }
    }

    /// Category of this error
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            RunError::Configuration(_) => ErrorKind::Configuration,
            RunError::Compile(_) => ErrorKind::Compile,
            RunError::Authentication(_) => ErrorKind::Authentication,
            RunError::Network(_) => ErrorKind::Network,
            RunError::Timeout(_) => ErrorKind::Timeout,
            RunError::NotFound(_) => ErrorKind::NotFound,
            RunError::Type(_) => ErrorKind::Type,
            RunError::Execution(_) => ErrorKind::Execution,
            RunError::Aborted => ErrorKind::Aborted,
        }
    }

    /// Message without the category prefix
    #[must_use]
    pub fn message(&self) -> String {
        match self {
            RunError::Configuration(m)
            | RunError::Compile(m)
            | RunError::Authentication(m)
            | RunError::Network(m)
            | RunError::Timeout(m)
            | RunError::NotFound(m)
            | RunError::Type(m)
            | RunError::Execution(m) => m.clone(),
            RunError::Aborted => "run aborted".to_string(),
        }
    }

    /// Value thrown into the script: `#{kind, message}`
    #[must_use]
    pub fn to_script(&self) -> Box<EvalAltResult> {
        if matches!(self, RunError::Aborted) {
            // Uncatchable, so `try` blocks cannot swallow an abort
            return EvalAltResult::ErrorTerminated(self.kind().as_str().into(), Position::NONE)
                .into();
        }

        let mut value = Map::new();
        value.insert("kind".into(), self.kind().as_str().into());
        value.insert("message".into(), self.message().into());
        EvalAltResult::ErrorRuntime(Dynamic::from_map(value), Position::NONE).into()
    }

    /// Recover the error that terminated script evaluation
    #[must_use]
    pub fn from_script(err: &EvalAltResult) -> Self {
        match err {
            EvalAltResult::ErrorInFunctionCall(_, _, inner, _)
            | EvalAltResult::ErrorInModule(_, inner, _) => Self::from_script(inner),
            EvalAltResult::ErrorTerminated(_, _) => RunError::Aborted,
            EvalAltResult::ErrorParsing(parse, pos) => {
                RunError::Compile(format!("{parse} ({pos})"))
            }
            EvalAltResult::ErrorRuntime(value, pos) => thrown_value(value, *pos),
            EvalAltResult::ErrorMismatchDataType(expected, actual, pos)
            | EvalAltResult::ErrorMismatchOutputType(expected, actual, pos) => RunError::Type(
                format!("expected {expected}, found {actual} ({pos})"),
            ),
            EvalAltResult::ErrorFunctionNotFound(_, _) | EvalAltResult::ErrorVariableNotFound(_, _) => {
                RunError::NotFound(err.to_string())
            }
            other => RunError::Execution(other.to_string()),
        }
    }
}

/// Interpret a `throw`n value; maps shaped like ours keep their kind
fn thrown_value(value: &Dynamic, pos: Position) -> RunError {
    if let Some(map) = value.read_lock::<Map>() {
        let kind = map
            .get("kind")
            .and_then(|k| k.clone().into_string().ok())
            .and_then(|k| ErrorKind::parse(&k));
        if let Some(kind) = kind {
            let message = map
                .get("message")
                .map(ToString::to_string)
                .unwrap_or_default();
            return RunError::new(kind, message);
        }
    }

    if pos.is_none() {
        RunError::Execution(value.to_string())
    } else {
        RunError::Execution(format!("{value} ({pos})"))
    }
}

impl From<ExecError> for RunError {
    fn from(err: ExecError) -> Self {
        let message = err.to_string();
        match err {
            ExecError::ConnectionFailed(_) | ExecError::TransferFailed(_) => {
                RunError::Network(message)
            }
            ExecError::NotConnected => RunError::Network(message),
            ExecError::AuthenticationFailed(_) | ExecError::SshKeyError(_) => {
                RunError::Authentication(message)
            }
            ExecError::Timeout { .. } => RunError::Timeout(message),
            ExecError::ConfigError(_) => RunError::Configuration(message),
            ExecError::SpawnError(_) | ExecError::IoError(_) => RunError::Execution(message),
            ExecError::Secret(secret) => secret.into(),
        }
    }
}

impl From<SecretError> for RunError {
    fn from(err: SecretError) -> Self {
        let message = err.to_string();
        match err {
            SecretError::NotFound(_) => RunError::NotFound(message),
            SecretError::WrongType { .. } => RunError::Type(message),
            SecretError::Closed => RunError::Aborted,
            SecretError::Io(_) => RunError::Execution(message),
        }
    }
}

impl From<std::io::Error> for RunError {
    fn from(err: std::io::Error) -> Self {
        match err.kind() {
            std::io::ErrorKind::NotFound => RunError::NotFound(err.to_string()),
            std::io::ErrorKind::TimedOut => RunError::Timeout(err.to_string()),
            _ => RunError::Execution(err.to_string()),
        }
    }
}

impl From<reqwest::Error> for RunError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            RunError::Timeout(err.to_string())
        } else if err.is_builder() {
            RunError::Configuration(err.to_string())
        } else {
            RunError::Network(err.to_string())
        }
    }
}

impl From<zip::result::ZipError> for RunError {
    fn from(err: zip::result::ZipError) -> Self {
        match err {
            zip::result::ZipError::Io(io) => io.into(),
            zip::result::ZipError::FileNotFound => RunError::NotFound(err.to_string()),
            other => RunError::Execution(other.to_string()),
        }
    }
}
