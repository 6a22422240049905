use std::fmt;
use std::io;
use std::sync::PoisonError;

pub type Result<T> = std::result::Result<T, Error>;

/// Status code carried across the engine boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Code {
    Ok,
    NotFound,
    Corruption,
    NotSupported,
    InvalidArgument,
    IoError,
    MergeInProgress,
    Incomplete,
    ShutdownInProgress,
    TimedOut,
    Aborted,
    Busy,
    Expired,
    TryAgain,
}

/// Optional refinement of a [`Code`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SubCode {
    None,
    MutexTimeout,
    LockTimeout,
    LockLimit,
    NoSpace,
    Deadlock,
    StaleFile,
    MemoryLimit,
    SpaceLimit,
    PathNotFound,
    ManualCompactionPaused,
    Overwritten,
    TxnNotPrepared,
    IoFenced,
}

#[derive(Debug)]
pub enum Error {
    IoError(io::Error),
    Decode(&'static str, io::Error),
    Corruption(String),
    ChecksumMismatch {
        context: &'static str,
        expected: u32,
        actual: u32,
    },
    NotFound(String),
    NotSupported(String),
    InvalidArgument(String),
    MergeInProgress,
    Incomplete(String),
    ShutdownInProgress,
    TimedOut(SubCode),
    Aborted(String),
    Busy(String),
    Expired,
    TryAgain(String),
    ManualCompactionPaused,
    MutexPoisoned,
    LockError(io::Error),
}

impl Error {
    pub fn code(&self) -> Code {
        match self {
            Error::IoError(_) | Error::LockError(_) => Code::IoError,
            Error::Decode(..) | Error::Corruption(_) | Error::ChecksumMismatch { .. } => {
                Code::Corruption
            }
            Error::NotFound(_) => Code::NotFound,
            Error::NotSupported(_) => Code::NotSupported,
            Error::InvalidArgument(_) => Code::InvalidArgument,
            Error::MergeInProgress => Code::MergeInProgress,
            Error::Incomplete(_) | Error::ManualCompactionPaused => Code::Incomplete,
            Error::ShutdownInProgress => Code::ShutdownInProgress,
            Error::TimedOut(_) => Code::TimedOut,
            Error::Aborted(_) | Error::MutexPoisoned => Code::Aborted,
            Error::Busy(_) => Code::Busy,
            Error::Expired => Code::Expired,
            Error::TryAgain(_) => Code::TryAgain,
        }
    }

    pub fn subcode(&self) -> SubCode {
        match self {
            Error::IoError(err) | Error::LockError(err) => io_subcode(err),
            Error::TimedOut(sub) => *sub,
            Error::ManualCompactionPaused => SubCode::ManualCompactionPaused,
            _ => SubCode::None,
        }
    }

    /// Free-text state string of the status.
    pub fn state(&self) -> String {
        self.to_string()
    }

    pub fn is_not_found(&self) -> bool {
        self.code() == Code::NotFound
    }

    pub fn is_corruption(&self) -> bool {
        self.code() == Code::Corruption
    }

    pub fn is_no_space(&self) -> bool {
        self.subcode() == SubCode::NoSpace
    }

    /// Builds an equivalent error. Used where one failure has to be reported
    /// to several callers, since `io::Error` is not `Clone`.
    pub fn duplicate(&self) -> Error {
        match self {
            Error::IoError(err) => Error::IoError(copy_io_error(err)),
            Error::LockError(err) => Error::LockError(copy_io_error(err)),
            Error::Decode(field, err) => Error::Decode(*field, copy_io_error(err)),
            Error::Corruption(msg) => Error::Corruption(msg.clone()),
            Error::ChecksumMismatch {
                context,
                expected,
                actual,
            } => Error::ChecksumMismatch {
                context: *context,
                expected: *expected,
                actual: *actual,
            },
            Error::NotFound(msg) => Error::NotFound(msg.clone()),
            Error::NotSupported(msg) => Error::NotSupported(msg.clone()),
            Error::InvalidArgument(msg) => Error::InvalidArgument(msg.clone()),
            Error::MergeInProgress => Error::MergeInProgress,
            Error::Incomplete(msg) => Error::Incomplete(msg.clone()),
            Error::ShutdownInProgress => Error::ShutdownInProgress,
            Error::TimedOut(sub) => Error::TimedOut(*sub),
            Error::Aborted(msg) => Error::Aborted(msg.clone()),
            Error::Busy(msg) => Error::Busy(msg.clone()),
            Error::Expired => Error::Expired,
            Error::TryAgain(msg) => Error::TryAgain(msg.clone()),
            Error::ManualCompactionPaused => Error::ManualCompactionPaused,
            Error::MutexPoisoned => Error::MutexPoisoned,
        }
    }
}

fn copy_io_error(err: &io::Error) -> io::Error {
    match err.raw_os_error() {
        Some(code) => io::Error::from_raw_os_error(code),
        None => io::Error::new(err.kind(), err.to_string()),
    }
}

fn io_subcode(err: &io::Error) -> SubCode {
    if err.raw_os_error() == Some(libc::ENOSPC) {
        return SubCode::NoSpace;
    }
    match err.kind() {
        io::ErrorKind::NotFound => SubCode::PathNotFound,
        _ => SubCode::None,
    }
}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Self {
        Error::IoError(err)
    }
}

impl<T> From<PoisonError<T>> for Error {
    fn from(_: PoisonError<T>) -> Self {
        Error::MutexPoisoned
    }
}

impl From<toml::de::Error> for Error {
    fn from(err: toml::de::Error) -> Self {
        Error::Corruption(format!("options file: {}", err))
    }
}

impl From<toml::ser::Error> for Error {
    fn from(err: toml::ser::Error) -> Self {
        Error::InvalidArgument(format!("options file: {}", err))
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::IoError(err) => write!(f, "IO error: {}", err),
            Error::Decode(field, err) => write!(f, "Corruption: failed to decode {}: {}", field, err),
            Error::Corruption(msg) => write!(f, "Corruption: {}", msg),
            Error::ChecksumMismatch {
                context,
                expected,
                actual,
            } => write!(
                f,
                "Corruption: {} checksum mismatch (expected {:#010x}, actual {:#010x})",
                context, expected, actual
            ),
            Error::NotFound(msg) => write!(f, "NotFound: {}", msg),
            Error::NotSupported(msg) => write!(f, "Not implemented: {}", msg),
            Error::InvalidArgument(msg) => write!(f, "Invalid argument: {}", msg),
            Error::MergeInProgress => write!(f, "Merge in progress"),
            Error::Incomplete(msg) => write!(f, "Result incomplete: {}", msg),
            Error::ShutdownInProgress => write!(f, "Shutdown in progress"),
            Error::TimedOut(SubCode::None) => write!(f, "Operation timed out"),
            Error::TimedOut(sub) => write!(f, "Operation timed out: {:?}", sub),
            Error::Aborted(msg) => write!(f, "Operation aborted: {}", msg),
            Error::Busy(msg) => write!(f, "Resource busy: {}", msg),
            Error::Expired => write!(f, "Operation expired"),
            Error::TryAgain(msg) => write!(f, "Operation failed. Try again.: {}", msg),
            Error::ManualCompactionPaused => {
                write!(f, "Result incomplete: Manual compaction paused")
            }
            Error::MutexPoisoned => write!(f, "Operation aborted: mutex was poisoned"),
            Error::LockError(err) => write!(f, "IO error: lock: {}", err),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::IoError(err) | Error::LockError(err) | Error::Decode(_, err) => Some(err),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_codes_follow_variants() {
        assert_eq!(Error::Corruption("x".into()).code(), Code::Corruption);
        assert_eq!(
            Error::ChecksumMismatch {
                context: "block",
                expected: 1,
                actual: 2
            }
            .code(),
            Code::Corruption
        );
        assert_eq!(Error::ManualCompactionPaused.code(), Code::Incomplete);
        assert_eq!(
            Error::ManualCompactionPaused.subcode(),
            SubCode::ManualCompactionPaused
        );
        assert_eq!(Error::TimedOut(SubCode::LockTimeout).subcode(), SubCode::LockTimeout);
        assert!(Error::NotFound("cf".into()).is_not_found());
    }

    #[test]
    fn test_io_subcodes() {
        let no_space = Error::from(io::Error::from_raw_os_error(libc::ENOSPC));
        assert_eq!(no_space.code(), Code::IoError);
        assert!(no_space.is_no_space());

        let missing = Error::from(io::Error::new(io::ErrorKind::NotFound, "gone"));
        assert_eq!(missing.subcode(), SubCode::PathNotFound);
    }

    #[test]
    fn test_duplicate_preserves_status() {
        let err = Error::from(io::Error::from_raw_os_error(libc::ENOSPC));
        let copy = err.duplicate();
        assert_eq!(copy.code(), err.code());
        assert_eq!(copy.subcode(), err.subcode());
        assert_eq!(copy.state(), err.state());
    }
}
