//! The kernel facility a [`Watcher`](crate::Watcher) is built on.
//!
//! A backend is split in two halves. The [`Backend`] itself owns the kernel queue and is moved
//! into the dispatch loop thread when the watcher is created; only that thread ever waits on the
//! queue or closes it. The [`Registrar`] is shared between every consumer thread and the dispatch
//! loop and is used to open, register, deregister and close per-path kernel handles, and to fire
//! the shutdown signal.
//!
//! Backends report coarse, per-handle conditions, exactly like a kqueue `EVFILT_VNODE` filter:
//! a directory handle only ever says "something in here changed", never which child.

use std::fmt;
use std::hash::Hash;
use std::io;
use std::path::Path;

use bitflags::bitflags;
use notify_vnode_types::event::Op;

use crate::{Config, Error};

#[cfg(any(target_os = "linux", target_os = "android"))]
pub mod inotify;
#[cfg(any(
    target_os = "freebsd",
    target_os = "openbsd",
    target_os = "netbsd",
    target_os = "dragonfly",
    target_os = "ios",
    target_os = "macos"
))]
pub mod kqueue;

bitflags! {
    /// Raw condition bits a backend reports for a handle, and the set of conditions a handle is
    /// registered for.
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
    pub struct Condition: u8 {
        /// The path was deleted (or access to it revoked).
        const DELETE = 0b0001;
        /// The file was written to, or an entry was added to or removed from the directory.
        const WRITE = 0b0010;
        /// The path was renamed.
        const RENAME = 0b0100;
        /// The attributes of the path changed.
        const ATTRIB = 0b1000;
    }
}

impl Condition {
    /// Conditions an explicitly watched path, or an implicitly watched file, is registered for.
    pub const ALL_EVENTS: Condition = Condition::all();

    /// Conditions an implicitly watched child directory is registered for: enough to learn that
    /// it went away, without descending into it.
    pub const DIRECTORY_CHILD: Condition = Condition::DELETE.union(Condition::RENAME);
}

impl From<Condition> for Op {
    fn from(condition: Condition) -> Self {
        let mut op = Op::empty();
        if condition.contains(Condition::DELETE) {
            op |= Op::REMOVE;
        }
        if condition.contains(Condition::WRITE) {
            op |= Op::WRITE;
        }
        if condition.contains(Condition::RENAME) {
            op |= Op::RENAME;
        }
        if condition.contains(Condition::ATTRIB) {
            op |= Op::CHMOD;
        }
        op
    }
}

/// A single notification: `condition` happened on the object behind `handle`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RawEvent<H> {
    /// The handle the notification was delivered for.
    pub handle: H,
    /// What happened.
    pub condition: Condition,
}

impl<H> RawEvent<H> {
    /// Creates a new raw event.
    pub fn new(handle: H, condition: Condition) -> Self {
        RawEvent { handle, condition }
    }
}

/// What a backend read from the kernel queue during one [`Backend::wait`].
#[derive(Debug)]
pub struct Batch<H> {
    events: Vec<RawEvent<H>>,
    errors: Vec<Error>,
}

impl<H> Default for Batch<H> {
    fn default() -> Self {
        Batch {
            events: Vec::new(),
            errors: Vec::new(),
        }
    }
}

impl<H: Handle> Batch<H> {
    /// Creates an empty batch.
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends `event` unless it repeats the previous event for the same handle.
    ///
    /// kqueue registrations use `EV_CLEAR`, so a burst of identical notifications on one
    /// descriptor is reported once per read. Backends built on other facilities get the same
    /// behaviour through this.
    pub fn push(&mut self, event: RawEvent<H>) {
        let repeated = self
            .events
            .iter()
            .rev()
            .find(|previous| previous.handle == event.handle)
            .is_some_and(|previous| previous.condition == event.condition);
        if !repeated {
            self.events.push(event);
        }
    }

    /// Removes the latest event for `handle` if it is exactly `condition`. Returns whether it
    /// did.
    pub fn retract(&mut self, handle: H, condition: Condition) -> bool {
        let latest = self.events.iter().rposition(|event| event.handle == handle);
        match latest {
            Some(index) if self.events[index].condition == condition => {
                self.events.remove(index);
                true
            }
            _ => false,
        }
    }

    /// Records an error that concerns a single registration, or events the queue lost. The
    /// backend keeps running.
    pub fn push_error(&mut self, error: Error) {
        self.errors.push(error);
    }

    /// The events, in the order the kernel delivered them.
    pub fn events(&self) -> &[RawEvent<H>] {
        &self.events
    }

    /// The errors recorded during the wait.
    pub fn errors(&self) -> &[Error] {
        &self.errors
    }

    /// Returns whether neither events nor errors were recorded.
    pub fn is_empty(&self) -> bool {
        self.events.is_empty() && self.errors.is_empty()
    }

    pub(crate) fn take(&mut self) -> (Vec<RawEvent<H>>, Vec<Error>) {
        (
            std::mem::take(&mut self.events),
            std::mem::take(&mut self.errors),
        )
    }
}

/// Why [`Backend::wait`] returned.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Wakeup {
    /// Kernel events were appended to the batch.
    Ready,
    /// The shutdown signal fired. The batch may still hold events that arrived in the same wait.
    Shutdown,
}

/// Identifier of a kernel registration.
pub trait Handle: Copy + Eq + Hash + fmt::Debug + Send + Sync + 'static {}

impl<T> Handle for T where T: Copy + Eq + Hash + fmt::Debug + Send + Sync + 'static {}

/// The half of a backend that owns the kernel queue.
pub trait Backend: Send + Sized + 'static {
    /// Identifier of a kernel registration.
    type Handle: Handle;

    /// The shared half of the backend.
    type Registrar: Registrar<Handle = Self::Handle>;

    /// Opens the kernel queue and the shutdown signal it wakes up on.
    fn open_queue(config: &Config) -> io::Result<(Self, Self::Registrar)>;

    /// Blocks until kernel events are available or the shutdown signal fires, appending the
    /// events to `batch` in the order the kernel delivered them.
    ///
    /// An error returned from here ends the dispatch loop, except for
    /// [`io::ErrorKind::Interrupted`], which means the wait should simply be retried. Errors
    /// about a single registration go to [`Batch::push_error`] instead.
    fn wait(&mut self, batch: &mut Batch<Self::Handle>) -> io::Result<Wakeup>;

    /// Closes the kernel queue and the read side of the shutdown signal.
    ///
    /// Every [`Registrar`] call made afterwards fails.
    fn close_queue(self) -> io::Result<()>;
}

/// The half of a backend that is shared between consumer threads and the dispatch loop.
pub trait Registrar: Send + Sync + 'static {
    /// Identifier of a kernel registration.
    type Handle: Handle;

    /// Opens a kernel handle for `path`. Symlinks have been resolved by the caller.
    fn open_handle(&self, path: &Path) -> io::Result<Self::Handle>;

    /// Registers `handle` with the queue for `condition`, replacing any previous registration.
    fn register(&self, handle: Self::Handle, condition: Condition) -> io::Result<()>;

    /// Removes the registration of `handle` from the queue.
    fn deregister(&self, handle: Self::Handle) -> io::Result<()>;

    /// Releases `handle`.
    fn close_handle(&self, handle: Self::Handle) -> io::Result<()>;

    /// Wakes up the dispatch loop blocked in [`Backend::wait`] with [`Wakeup::Shutdown`].
    fn trigger_shutdown(&self) -> io::Result<()>;
}

/// The recommended [`Backend`] implementation for the current platform
#[cfg(any(target_os = "linux", target_os = "android"))]
pub type RecommendedBackend = inotify::InotifyBackend;
/// The recommended [`Backend`] implementation for the current platform
#[cfg(any(
    target_os = "freebsd",
    target_os = "openbsd",
    target_os = "netbsd",
    target_os = "dragonfly",
    target_os = "ios",
    target_os = "macos"
))]
pub type RecommendedBackend = kqueue::KqueueBackend;
