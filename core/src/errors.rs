//! The error taxonomy.
//!
//! Every failure in the system maps to one [`ErrorKind`] with a stable
//! negative code; zero and positive values mean success. An [`Error`] couples
//! the kind with optional free-form details for diagnostics.

use std::fmt;

/// Stable error codes.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
#[repr(i32)]
#[non_exhaustive]
pub enum ErrorKind {
    Unknown = -1,
    ObjectStillUsed = -2,
    BadAlloc = -3,
    InvalidParam = -4,
    InvalidHandle = -5,
    WrongObjectType = -6,
    Canceled = -7,
    Busy = -8,
    Timeout = -9,
    TimerExpired = -10,
    BufferTooSmall = -11,
    OpenSocketFailed = -12,
    BindSocketFailed = -13,
    ListenSocketFailed = -14,
    SetSocketOptionFailed = -15,
    InvalidRegex = -16,
    ReadFileFailed = -17,
    RwSocketFailed = -18,
    ConnectSocketFailed = -19,
    InvalidMagicPrefix = -20,
    IncompatibleVersion = -21,
    DeserializeMsgFailed = -22,
    AcceptSocketFailed = -23,
    LoopbackConnection = -24,
    PasswordMismatch = -25,
    NetNameMismatch = -26,
    DuplicateBranchName = -27,
    DuplicateBranchPath = -28,
    PayloadTooLarge = -29,
    ParsingCmdlineFailed = -30,
    ParsingJsonFailed = -31,
    ParsingFileFailed = -32,
    ConfigNotValid = -33,
    HelpRequested = -34,
    WriteFileFailed = -35,
    UndefinedVariables = -36,
    NoVariableSupport = -37,
    VariableUsedInKey = -38,
    InvalidTimeFormat = -39,
    ParsingTimeFailed = -40,
    TxQueueFull = -41,
    InvalidOperationId = -42,
    OperationNotRunning = -43,
    InvalidUserMsgpack = -44,
    JoinMulticastGroupFailed = -45,
    EnumerateNetworkInterfacesFailed = -46,
    ConfigurationSectionNotFound = -47,
    ConfigurationValidationFailed = -48,
    // -49 stays unassigned so the codes after it keep their values.
    OpenFileFailed = -50,
}

impl ErrorKind {
    /// The stable numeric code.
    pub const fn code(self) -> i32 {
        self as i32
    }

    /// Human-readable description of the error.
    pub const fn description(self) -> &'static str {
        use ErrorKind::*;
        match self {
            Unknown => "Unknown internal error occured",
            ObjectStillUsed => "The object is still being used by another object",
            BadAlloc => "Insufficient memory to complete the operation",
            InvalidParam => "Invalid parameter",
            InvalidHandle => "Invalid Handle",
            WrongObjectType => "Object is of the wrong type",
            Canceled => "The operation has been canceled",
            Busy => "Operation failed because the object is busy",
            Timeout => "The operation timed out",
            TimerExpired => "The timer has not been started or already expired",
            BufferTooSmall => "The supplied buffer is too small",
            OpenSocketFailed => "Could not open a socket",
            BindSocketFailed => "Could not bind a socket",
            ListenSocketFailed => "Could not listen on socket",
            SetSocketOptionFailed => "Could not set a socket option",
            InvalidRegex => "Invalid regular expression",
            ReadFileFailed => "Could not read from file",
            RwSocketFailed => "Could not read from or write to socket",
            ConnectSocketFailed => "Could not connect a socket",
            InvalidMagicPrefix => "The magic prefix sent when establishing a connection is wrong",
            IncompatibleVersion => "The Yogi versions are not compatible",
            DeserializeMsgFailed => "Could not deserialize a message",
            AcceptSocketFailed => "Could not accept a socket",
            LoopbackConnection => "Attempting to connect branch to itself",
            PasswordMismatch => "The passwords of the local and remote branch do not match",
            NetNameMismatch => "The net names of the local and remote branch do not match",
            DuplicateBranchName => "A branch with the same name is already active",
            DuplicateBranchPath => "A branch with the same path is already active",
            PayloadTooLarge => "Message payload is too large",
            ParsingCmdlineFailed => "Parsing the command line failed",
            ParsingJsonFailed => "Parsing a JSON string failed",
            ParsingFileFailed => "Parsing a configuration file failed",
            ConfigNotValid => "The configuration is not valid",
            HelpRequested => "Help/usage text requested",
            WriteFileFailed => "Could not write to file",
            UndefinedVariables => {
                "One or more configuration variables are undefined or could not be resolved"
            }
            NoVariableSupport => "Support for configuration variables has been disabled",
            VariableUsedInKey => "A configuration variable has been used in a key",
            InvalidTimeFormat => "Invalid time format",
            ParsingTimeFailed => "Could not parse time string",
            TxQueueFull => "A send queue for a remote branch is full",
            InvalidOperationId => "Invalid operation ID",
            OperationNotRunning => "Operation is not running",
            InvalidUserMsgpack => "User-supplied data is not valid MessagePack",
            JoinMulticastGroupFailed => "Joining UDP multicast group failed",
            EnumerateNetworkInterfacesFailed => "Enumerating network interfaces failed",
            ConfigurationSectionNotFound => "The section could not be found in the configuration",
            ConfigurationValidationFailed => "Validating the configuration failed",
            OpenFileFailed => "Could not open file",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.description())
    }
}

/// An error kind plus optional descriptive details.
#[derive(Clone, PartialEq, Eq)]
pub struct Error {
    kind: ErrorKind,
    details: Option<String>,
}

impl std::error::Error for Error {}

impl Error {
    pub fn new(kind: ErrorKind) -> Error {
        Error { kind, details: None }
    }

    pub fn with_details(kind: ErrorKind, details: impl Into<String>) -> Error {
        Error {
            kind,
            details: Some(details.into()),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    pub fn details(&self) -> Option<&str> {
        self.details.as_deref()
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.details {
            Some(details) => write!(f, "{}: {}", self.kind, details),
            None => write!(f, "{}", self.kind),
        }
    }
}

impl fmt::Debug for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Error({:?}", self.kind)?;
        if let Some(details) = &self.details {
            write!(f, ", {details:?}")?;
        }
        write!(f, ")")
    }
}

impl From<ErrorKind> for Error {
    fn from(kind: ErrorKind) -> Error {
        Error::new(kind)
    }
}

pub type Result<T> = std::result::Result<T, Error>;

impl From<yogi_config::ConfigError> for Error {
    fn from(err: yogi_config::ConfigError) -> Error {
        use yogi_config::ConfigError::*;

        let kind = match &err {
            ParsingJsonFailed(_) => ErrorKind::ParsingJsonFailed,
            ParsingFileFailed(_) => ErrorKind::ParsingFileFailed,
            ParsingCmdlineFailed(_) => ErrorKind::ParsingCmdlineFailed,
            ConfigNotValid(_) => ErrorKind::ConfigNotValid,
            HelpRequested(_) => ErrorKind::HelpRequested,
            UndefinedVariables(_) => ErrorKind::UndefinedVariables,
            NoVariableSupport => ErrorKind::NoVariableSupport,
            VariableUsedInKey(_) => ErrorKind::VariableUsedInKey,
            SectionNotFound(_) => ErrorKind::ConfigurationSectionNotFound,
            ValidationFailed(_) => ErrorKind::ConfigurationValidationFailed,
            InvalidParam(_) => ErrorKind::InvalidParam,
            WriteFileFailed(_) => ErrorKind::WriteFileFailed,
        };

        match err {
            HelpRequested(usage) => Error::with_details(kind, usage),
            other => Error::with_details(kind, other.to_string()),
        }
    }
}

impl From<yogi_primitives::TimeError> for Error {
    fn from(err: yogi_primitives::TimeError) -> Error {
        use yogi_primitives::TimeError;

        let kind = match err {
            TimeError::InvalidFormat => ErrorKind::InvalidTimeFormat,
            TimeError::ParseFailed => ErrorKind::ParsingTimeFailed,
            TimeError::ConflictingInfinities => ErrorKind::InvalidParam,
        };

        Error::new(kind)
    }
}

impl From<yogi_logger::LoggerError> for Error {
    fn from(err: yogi_logger::LoggerError) -> Error {
        use yogi_logger::LoggerError;

        let kind = match &err {
            LoggerError::InvalidRegex(_) => ErrorKind::InvalidRegex,
            LoggerError::InvalidVerbosity(_) => ErrorKind::InvalidParam,
            LoggerError::OpenFileFailed(_) => ErrorKind::OpenFileFailed,
            LoggerError::InvalidTimeFormat(_) => ErrorKind::InvalidTimeFormat,
        };

        Error::with_details(kind, err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_are_stable_and_negative() {
        assert_eq!(ErrorKind::Unknown.code(), -1);
        assert_eq!(ErrorKind::Canceled.code(), -7);
        assert_eq!(ErrorKind::Timeout.code(), -9);
        assert_eq!(ErrorKind::PasswordMismatch.code(), -25);
        assert_eq!(ErrorKind::TxQueueFull.code(), -41);
        assert_eq!(ErrorKind::ReadFileFailed.code(), -17);
        assert_eq!(ErrorKind::OpenFileFailed.code(), -50);
    }

    #[test]
    fn display_includes_details() {
        let err = Error::with_details(ErrorKind::Timeout, "after 3s");
        assert_eq!(err.to_string(), "The operation timed out: after 3s");
        assert_eq!(Error::new(ErrorKind::Busy).to_string(), ErrorKind::Busy.description());
    }

    #[test]
    fn config_errors_map_into_the_taxonomy() {
        let err: Error = yogi_config::ConfigError::NoVariableSupport.into();
        assert_eq!(err.kind(), ErrorKind::NoVariableSupport);

        let err: Error = yogi_config::ConfigError::HelpRequested("usage: ...".into()).into();
        assert_eq!(err.kind(), ErrorKind::HelpRequested);
        assert_eq!(err.details(), Some("usage: ..."));
    }
}
