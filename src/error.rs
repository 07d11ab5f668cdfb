use std::fmt;

use crate::tls::alert::AlertDescription;

/// The three error kinds distinguished by the handshake core.
///
/// `Fatal` invalidates the session and carries the alert description the
/// record layer should send. `NonFatal` is returned to the caller unchanged;
/// the state machine does not advance. `AppVisible` surfaces a decision the
/// application must make (e.g. whether to perform a post-handshake reauth).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Kind {
    Fatal(AlertDescription),
    NonFatal,
    AppVisible,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Error {
    kind: Kind,
    message: String,
}

impl Error {
    pub fn fatal(alert: AlertDescription, message: impl Into<String>) -> Self {
        Self {
            kind: Kind::Fatal(alert),
            message: message.into(),
        }
    }

    pub fn non_fatal(message: impl Into<String>) -> Self {
        Self {
            kind: Kind::NonFatal,
            message: message.into(),
        }
    }

    pub fn app_visible(message: impl Into<String>) -> Self {
        Self {
            kind: Kind::AppVisible,
            message: message.into(),
        }
    }

    pub fn again() -> Self {
        Self::non_fatal("again")
    }

    pub fn would_block() -> Self {
        Self::non_fatal("would block")
    }

    pub fn timed_out() -> Self {
        Self::non_fatal("timed out")
    }

    pub fn reauth_request() -> Self {
        Self::app_visible("reauth_request")
    }

    pub fn kind(&self) -> &Kind {
        &self.kind
    }

    pub fn is_fatal(&self) -> bool {
        matches!(self.kind, Kind::Fatal(_))
    }

    pub fn alert(&self) -> Option<AlertDescription> {
        match self.kind {
            Kind::Fatal(a) => Some(a),
            _ => None,
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match &self.kind {
            Kind::Fatal(alert) => write!(f, "fatal error ({:?}): {}", alert, self.message),
            Kind::NonFatal => write!(f, "non-fatal: {}", self.message),
            Kind::AppVisible => write!(f, "{}", self.message),
        }
    }
}

impl std::error::Error for Error {}

pub type Result<T> = std::result::Result<T, Error>;

/// Shorthand for constructing an `internal_error` fatal error (a programmer
/// error: inconsistent sizes passed to the key schedule, an unreachable
/// match arm, etc).
pub fn internal_error(message: impl Into<String>) -> Error {
    Error::fatal(AlertDescription::internal_error, message)
}

pub fn illegal_parameter(message: impl Into<String>) -> Error {
    Error::fatal(AlertDescription::illegal_parameter, message)
}

#[macro_export]
macro_rules! err_msg {
    ($alert:expr, $($arg:tt)*) => {
        $crate::error::Error::fatal($alert, format!($($arg)*))
    };
}
