//! Backend built on the kqueue API
//!
//! The kqueue() system call provides a generic method of notifying the user
//! when an event happens or a condition holds, based on the results of small
//! pieces of kernel code termed filters. Every watched path gets its own open
//! descriptor and an `EVFILT_VNODE` filter on it.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::fs::{File, OpenOptions};
use std::io;
use std::os::unix::fs::OpenOptionsExt;
use std::os::unix::io::{AsRawFd, RawFd};
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use kqueue::{EventData, EventFilter, FilterFlag, Ident};

use super::{Backend, Batch, Condition, RawEvent, Registrar, Wakeup};
use crate::{Config, Error};

const KQUEUE: mio::Token = mio::Token(0);
const SHUTDOWN: mio::Token = mio::Token(1);

// Only ask for event notifications, don't keep the volume busy.
#[cfg(any(target_os = "macos", target_os = "ios"))]
const OPEN_FLAGS: libc::c_int = libc::O_EVTONLY;
#[cfg(not(any(target_os = "macos", target_os = "ios")))]
const OPEN_FLAGS: libc::c_int = libc::O_NONBLOCK;

/// [`Backend`] implementation based on kqueue
pub struct KqueueBackend {
    poll: mio::Poll,
    events: mio::Events,
    shared: Arc<Shared>,
}

/// [`Registrar`] of the [`KqueueBackend`]
pub struct KqueueRegistrar {
    shared: Arc<Shared>,
}

struct Shared {
    waker: mio::Waker,
    // `None` once the queue was closed.
    queue: Mutex<Option<Queue>>,
}

struct Queue {
    kqueue: kqueue::Watcher,
    files: HashMap<RawFd, File>,
    registered: HashSet<RawFd>,
}

impl Shared {
    fn queue(&self) -> MutexGuard<'_, Option<Queue>> {
        self.queue.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn queue_closed() -> io::Error {
    io::Error::new(io::ErrorKind::Other, "kqueue is closed")
}

fn unknown_descriptor(fd: RawFd) -> io::Error {
    io::Error::new(
        io::ErrorKind::InvalidInput,
        format!("descriptor {fd} is not open in this kqueue"),
    )
}

fn filter_flags(condition: Condition) -> FilterFlag {
    let mut flags = FilterFlag::empty();
    if condition.contains(Condition::DELETE) {
        flags |= FilterFlag::NOTE_DELETE | FilterFlag::NOTE_REVOKE;
    }
    if condition.contains(Condition::WRITE) {
        flags |= FilterFlag::NOTE_WRITE | FilterFlag::NOTE_EXTEND;
    }
    if condition.contains(Condition::ATTRIB) {
        flags |= FilterFlag::NOTE_ATTRIB;
    }
    if condition.contains(Condition::RENAME) {
        flags |= FilterFlag::NOTE_RENAME;
    }
    flags
}

fn condition_of(vnode: &kqueue::Vnode) -> Condition {
    match vnode {
        // Access to the file was revoked via revoke(2) or the underlying file system was
        // unmounted. Nothing more will be reported for it either way.
        kqueue::Vnode::Delete | kqueue::Vnode::Revoke => Condition::DELETE,

        // Extend and Truncate are just different names for the same operation, extend is only
        // used on FreeBSD, truncate everywhere else
        kqueue::Vnode::Write | kqueue::Vnode::Extend | kqueue::Vnode::Truncate => {
            Condition::WRITE
        }
        kqueue::Vnode::Attrib => Condition::ATTRIB,
        kqueue::Vnode::Rename => Condition::RENAME,

        // On different BSD variants, different extra events may be present
        #[allow(unreachable_patterns)]
        _ => Condition::empty(),
    }
}

impl Queue {
    fn register(&mut self, fd: RawFd, condition: Condition) -> io::Result<()> {
        if !self.files.contains_key(&fd) {
            return Err(unknown_descriptor(fd));
        }
        if self.registered.remove(&fd) {
            self.kqueue.remove_fd(fd, EventFilter::EVFILT_VNODE)?;
        }
        self.kqueue
            .add_fd(fd, EventFilter::EVFILT_VNODE, filter_flags(condition))?;
        self.kqueue.watch()?;
        self.registered.insert(fd);
        Ok(())
    }

    fn deregister(&mut self, fd: RawFd) -> io::Result<()> {
        if !self.files.contains_key(&fd) {
            return Err(unknown_descriptor(fd));
        }
        if self.registered.remove(&fd) {
            self.kqueue.remove_fd(fd, EventFilter::EVFILT_VNODE)?;
            self.kqueue.watch()?;
        }
        Ok(())
    }
}

impl Backend for KqueueBackend {
    type Handle = RawFd;
    type Registrar = KqueueRegistrar;

    fn open_queue(_config: &Config) -> io::Result<(Self, Self::Registrar)> {
        let kqueue = kqueue::Watcher::new()?;
        let poll = mio::Poll::new()?;
        let waker = mio::Waker::new(poll.registry(), SHUTDOWN)?;

        let kqueue_fd = kqueue.as_raw_fd();
        let mut evented_kqueue = mio::unix::SourceFd(&kqueue_fd);
        poll.registry()
            .register(&mut evented_kqueue, KQUEUE, mio::Interest::READABLE)?;

        let shared = Arc::new(Shared {
            waker,
            queue: Mutex::new(Some(Queue {
                kqueue,
                files: HashMap::new(),
                registered: HashSet::new(),
            })),
        });

        let backend = KqueueBackend {
            poll,
            events: mio::Events::with_capacity(16),
            shared: Arc::clone(&shared),
        };
        Ok((backend, KqueueRegistrar { shared }))
    }

    fn wait(&mut self, batch: &mut Batch<RawFd>) -> io::Result<Wakeup> {
        self.poll.poll(&mut self.events, None)?;

        let mut wakeup = Wakeup::Ready;
        let mut readable = false;
        for event in &self.events {
            match event.token() {
                SHUTDOWN => wakeup = Wakeup::Shutdown,
                KQUEUE => readable = true,
                token => log::debug!("unexpected mio token {token:?}"),
            }
        }
        if !readable {
            return Ok(wakeup);
        }

        let mut guard = self.shared.queue();
        let queue = guard.as_mut().ok_or_else(queue_closed)?;
        while let Some(event) = queue.kqueue.poll(None) {
            log::trace!("kqueue event: {event:?}");

            match event {
                kqueue::Event {
                    data: EventData::Vnode(vnode),
                    ident: Ident::Fd(fd),
                } => {
                    let condition = condition_of(&vnode);
                    if !condition.is_empty() {
                        batch.push(RawEvent::new(fd, condition));
                    }
                }
                // EV_ERROR for a single descriptor, the queue itself is fine
                kqueue::Event {
                    data: EventData::Error(err),
                    ..
                } => batch.push_error(Error::io(err)),
                // only descriptor vnode filters are ever added
                other => log::debug!("unexpected kqueue event: {other:?}"),
            }
        }
        Ok(wakeup)
    }

    fn close_queue(self) -> io::Result<()> {
        // drops the kqueue and every descriptor still open in it
        self.shared.queue().take();
        drop(self.poll);
        Ok(())
    }
}

impl Registrar for KqueueRegistrar {
    type Handle = RawFd;

    fn open_handle(&self, path: &Path) -> io::Result<RawFd> {
        log::trace!("opening kqueue handle: {}", path.display());

        let mut guard = self.shared.queue();
        let queue = guard.as_mut().ok_or_else(queue_closed)?;
        let file = OpenOptions::new()
            .read(true)
            .custom_flags(OPEN_FLAGS)
            .open(path)?;
        let fd = file.as_raw_fd();
        queue.files.insert(fd, file);
        Ok(fd)
    }

    fn register(&self, handle: RawFd, condition: Condition) -> io::Result<()> {
        let mut guard = self.shared.queue();
        let queue = guard.as_mut().ok_or_else(queue_closed)?;
        queue.register(handle, condition)
    }

    fn deregister(&self, handle: RawFd) -> io::Result<()> {
        let mut guard = self.shared.queue();
        let queue = guard.as_mut().ok_or_else(queue_closed)?;
        queue.deregister(handle)
    }

    fn close_handle(&self, handle: RawFd) -> io::Result<()> {
        let mut guard = self.shared.queue();
        let queue = guard.as_mut().ok_or_else(queue_closed)?;
        if queue.registered.remove(&handle) {
            // closing the descriptor drops the filter anyway
            queue.kqueue.remove_fd(handle, EventFilter::EVFILT_VNODE).ok();
        }
        queue
            .files
            .remove(&handle)
            .map(drop)
            .ok_or_else(|| unknown_descriptor(handle))
    }

    fn trigger_shutdown(&self) -> io::Result<()> {
        self.shared.waker.wake()
    }
}

impl fmt::Debug for KqueueBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KqueueBackend").finish_non_exhaustive()
    }
}

impl fmt::Debug for KqueueRegistrar {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let guard = self.shared.queue();
        f.debug_struct("KqueueRegistrar")
            .field("closed", &guard.is_none())
            .field("handles", &guard.as_ref().map_or(0, |q| q.files.len()))
            .finish()
    }
}
