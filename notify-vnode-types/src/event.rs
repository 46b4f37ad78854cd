//! The `Event` type and the `Op` bitmask.

use std::{
    fmt,
    path::{Path, PathBuf},
};

use bitflags::bitflags;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

bitflags! {
    /// Operations that may have been performed on a path.
    ///
    /// The set is deliberately small: it is what every kernel-event-queue backend can report,
    /// either directly or by synthesis. Operations are not mutually exclusive, a single event may
    /// carry several of them, e.g. a kqueue descriptor that was written to and then deleted before
    /// the queue was read reports `WRITE | REMOVE`.
    ///
    /// # Examples
    ///
    /// ```
    /// use notify_vnode_types::event::Op;
    ///
    /// let op = Op::WRITE | Op::CHMOD;
    /// assert!(op.contains(Op::WRITE));
    /// assert_eq!(op.to_string(), "WRITE|CHMOD");
    /// ```
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
    #[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
    pub struct Op: u8 {
        /// A new path appeared.
        ///
        /// Never reported by the kernel directly: it is synthesized by diffing a directory's
        /// listing against the children known to exist.
        const CREATE = 0b0000_0001;

        /// The contents of the path were written to.
        const WRITE = 0b0000_0010;

        /// The path was removed.
        const REMOVE = 0b0000_0100;

        /// The path was renamed away. The new name, if it lands in a watched directory, is
        /// reported by a separate `CREATE`.
        const RENAME = 0b0000_1000;

        /// The attributes of the path changed (permissions, ownership, timestamps, link count).
        const CHMOD = 0b0001_0000;
    }
}

impl Op {
    /// Returns whether the event removed the path from the watch, either by deletion or by
    /// renaming it away.
    pub fn is_removal(&self) -> bool {
        self.intersects(Op::REMOVE | Op::RENAME)
    }
}

impl fmt::Display for Op {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        const NAMES: [(Op, &str); 5] = [
            (Op::CREATE, "CREATE"),
            (Op::WRITE, "WRITE"),
            (Op::REMOVE, "REMOVE"),
            (Op::RENAME, "RENAME"),
            (Op::CHMOD, "CHMOD"),
        ];

        let mut first = true;
        for (op, name) in NAMES {
            if self.contains(op) {
                if !first {
                    f.write_str("|")?;
                }
                f.write_str(name)?;
                first = false;
            }
        }
        if first {
            f.write_str("NONE")?;
        }
        Ok(())
    }
}

/// A single change notification.
///
/// A kernel notification for a file becomes one `Event` for the file. A notification that a
/// directory's entries changed is not reported itself: the directory is listed again and every
/// new child is reported as a `CREATE`. Overwrite detection may follow a removal with a `CREATE`
/// for the same path.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct Event {
    /// The path the event is about.
    ///
    /// This is the path the watch was registered under: relative paths were made absolute and
    /// cleaned, and a watched symlink is reported under its resolved target.
    pub path: PathBuf,

    /// What happened to the path.
    pub op: Op,
}

impl Event {
    /// Creates a new event.
    pub fn new(path: impl Into<PathBuf>, op: Op) -> Self {
        Event {
            path: path.into(),
            op,
        }
    }

    /// Creates a `CREATE` event.
    pub fn create(path: impl Into<PathBuf>) -> Self {
        Self::new(path, Op::CREATE)
    }

    /// Returns whether all operations in `op` are part of this event.
    pub fn has(&self, op: Op) -> bool {
        self.op.contains(op)
    }

    /// The path of the event.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl fmt::Display for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:<13} {:?}", self.op.to_string(), self.path)
    }
}
