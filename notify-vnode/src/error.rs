//! Error types

use std::error::Error as StdError;
use std::path::PathBuf;
use std::result::Result as StdResult;
use std::{fmt, io};

/// Type alias to use this library's [`Error`] type in a Result
pub type Result<T> = StdResult<T, Error>;

/// Error kinds
#[derive(Debug)]
pub enum ErrorKind {
    /// Generic error
    ///
    /// May be used in cases where a platform specific error is mapped to this type, or for opaque
    /// internal errors.
    Generic(String),

    /// I/O errors.
    Io(io::Error),

    /// A path does not exist.
    PathNotFound,

    /// Attempted to remove a watch that does not exist.
    WatchNotFound,

    /// Can't watch (more) files, the descriptor limit of the process or of the system was
    /// reached.
    MaxFilesWatch,

    /// The watcher was closed, or its dispatch loop died, and can't accept new watches.
    Closed,
}

/// Notify error type.
///
/// Errors are emitted either from [`Watcher::add`](crate::Watcher::add) and
/// [`Watcher::remove`](crate::Watcher::remove) (admission errors), or on the
/// [`Watcher::errors`](crate::Watcher::errors) sink (errors while dispatching).
#[derive(Debug)]
pub struct Error {
    /// Kind of the error.
    pub kind: ErrorKind,

    /// Relevant paths to the error, if any.
    pub paths: Vec<PathBuf>,
}

impl Error {
    /// Adds a path to the error.
    pub fn add_path(mut self, path: PathBuf) -> Self {
        self.paths.push(path);
        self
    }

    /// Replaces the paths for the error.
    pub fn set_paths(mut self, paths: Vec<PathBuf>) -> Self {
        self.paths = paths;
        self
    }

    /// Creates a new Error with empty paths given its kind.
    pub fn new(kind: ErrorKind) -> Self {
        Self {
            kind,
            paths: Vec::new(),
        }
    }

    /// Creates a new generic Error from a message.
    pub fn generic(msg: &str) -> Self {
        Self::new(ErrorKind::Generic(msg.into()))
    }

    /// Creates a new i/o Error from a stdlib `io::Error`.
    pub fn io(err: io::Error) -> Self {
        Self::new(ErrorKind::Io(err))
    }

    /// Similar to [`Error::io`], but specialized for errors raised while admitting a watch:
    /// a missing path becomes [`ErrorKind::PathNotFound`] and descriptor exhaustion becomes
    /// [`ErrorKind::MaxFilesWatch`].
    pub fn io_watch(err: io::Error) -> Self {
        if err.kind() == io::ErrorKind::NotFound {
            return Self::path_not_found();
        }
        match err.raw_os_error() {
            Some(libc::ENOSPC) | Some(libc::EMFILE) | Some(libc::ENFILE) => {
                Self::new(ErrorKind::MaxFilesWatch)
            }
            _ => Self::io(err),
        }
    }

    /// Creates a new "path not found" error.
    pub fn path_not_found() -> Self {
        Self::new(ErrorKind::PathNotFound)
    }

    /// Creates a new "watch not found" error.
    pub fn watch_not_found() -> Self {
        Self::new(ErrorKind::WatchNotFound)
    }

    /// Creates a new "watcher closed" error.
    pub fn closed() -> Self {
        Self::new(ErrorKind::Closed)
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let error = match self.kind {
            ErrorKind::PathNotFound => "No path was found.".to_string(),
            ErrorKind::WatchNotFound => "No watch was found.".to_string(),
            ErrorKind::MaxFilesWatch => "OS file watch limit reached.".to_string(),
            ErrorKind::Closed => "The watcher is closed.".to_string(),
            ErrorKind::Generic(ref err) => err.clone(),
            ErrorKind::Io(ref err) => err.to_string(),
        };

        if self.paths.is_empty() {
            write!(f, "{}", error)
        } else {
            write!(f, "{} about {:?}", error, self.paths)
        }
    }
}

impl StdError for Error {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        match self.kind {
            ErrorKind::Io(ref cause) => Some(cause),
            _ => None,
        }
    }
}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Self {
        Error::io(err)
    }
}

impl<T> From<crossbeam_channel::SendError<T>> for Error {
    fn from(err: crossbeam_channel::SendError<T>) -> Self {
        Error::generic(&format!("internal channel disconnect: {:?}", err))
    }
}

#[test]
fn display_formatted_errors() {
    let expected = "Some error";

    assert_eq!(expected, format!("{}", Error::generic(expected)));

    assert_eq!(
        expected,
        format!(
            "{}",
            Error::io(io::Error::new(io::ErrorKind::Other, expected))
        )
    );

    assert_eq!(
        r#"No watch was found. about ["/tmp/a"]"#,
        format!("{}", Error::watch_not_found().add_path("/tmp/a".into()))
    );
}

#[test]
fn io_watch_classifies_admission_errors() {
    let missing = Error::io_watch(io::Error::from(io::ErrorKind::NotFound));
    assert!(matches!(missing.kind, ErrorKind::PathNotFound));

    let exhausted = Error::io_watch(io::Error::from_raw_os_error(libc::EMFILE));
    assert!(matches!(exhausted.kind, ErrorKind::MaxFilesWatch));

    let denied = Error::io_watch(io::Error::from(io::ErrorKind::PermissionDenied));
    assert!(matches!(denied.kind, ErrorKind::Io(_)));
}
