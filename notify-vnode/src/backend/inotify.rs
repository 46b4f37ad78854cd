//! Backend built on the inotify Linux API
//!
//! inotify reports events for a watched inode and, for directories, for each named child. This
//! backend throws the child names away and reports what a kqueue vnode filter would: a watched
//! directory only learns that its entries changed, and the engine diffs its listing to find out
//! which child was created.

use std::collections::HashMap;
use std::fmt;
use std::io;
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use inotify as inotify_sys;
use inotify_sys::{EventMask, Inotify, WatchDescriptor, WatchMask, Watches};

use super::{Backend, Batch, Condition, RawEvent, Registrar, Wakeup};
use crate::{Config, Error};

const INOTIFY: mio::Token = mio::Token(0);
const SHUTDOWN: mio::Token = mio::Token(1);

const NAME_MAX: usize = 255;

/// Handle of a registration with the inotify backend.
///
/// Several tokens may share one kernel watch descriptor, since inotify keeps a single watch per
/// inode while the engine keeps one per path.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct WatchToken(u64);

/// [`Backend`] implementation based on inotify
pub struct InotifyBackend {
    poll: mio::Poll,
    events: mio::Events,
    inotify: Inotify,
    buffer: Vec<u8>,
    shared: Arc<Shared>,
}

/// [`Registrar`] of the [`InotifyBackend`]
pub struct InotifyRegistrar {
    shared: Arc<Shared>,
}

struct Shared {
    waker: mio::Waker,
    // `None` once the queue was closed.
    registry: Mutex<Option<Registry>>,
}

struct Registry {
    watches: Watches,
    next_token: u64,
    tokens: HashMap<WatchToken, Registration>,
    descriptors: HashMap<WatchDescriptor, Vec<WatchToken>>,
}

struct Registration {
    path: PathBuf,
    descriptor: Option<WatchDescriptor>,
    condition: Condition,
}

impl Shared {
    fn registry(&self) -> MutexGuard<'_, Option<Registry>> {
        self.registry.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn queue_closed() -> io::Error {
    io::Error::new(io::ErrorKind::Other, "inotify queue is closed")
}

fn queue_overflowed() -> Error {
    Error::generic("inotify queue overflowed, events were lost")
}

fn unknown_token(token: WatchToken) -> io::Error {
    io::Error::new(
        io::ErrorKind::InvalidInput,
        format!("unknown inotify watch token {:?}", token),
    )
}

fn watch_mask(condition: Condition) -> WatchMask {
    let mut mask = WatchMask::empty();
    if condition.contains(Condition::DELETE) {
        mask |= WatchMask::DELETE_SELF;
    }
    if condition.contains(Condition::RENAME) {
        mask |= WatchMask::MOVE_SELF;
    }
    if condition.contains(Condition::ATTRIB) {
        mask |= WatchMask::ATTRIB;
    }
    if condition.contains(Condition::WRITE) {
        mask |= WatchMask::MODIFY
            | WatchMask::CREATE
            | WatchMask::DELETE
            | WatchMask::MOVED_FROM
            | WatchMask::MOVED_TO;
    }
    mask
}

/// Reduces an inotify event to the condition a vnode filter would have reported for the
/// watched inode.
fn condition_of(mask: EventMask, named: bool) -> Condition {
    let mut condition = Condition::empty();
    if named {
        // An entry of the watched directory changed: a coarse write on the directory. Data and
        // attribute changes of the children are not the directory's business.
        if mask.intersects(
            EventMask::CREATE | EventMask::DELETE | EventMask::MOVED_FROM | EventMask::MOVED_TO,
        ) {
            condition |= Condition::WRITE;
        }
        return condition;
    }
    if mask.contains(EventMask::MODIFY) {
        condition |= Condition::WRITE;
    }
    if mask.contains(EventMask::ATTRIB) {
        condition |= Condition::ATTRIB;
    }
    if mask.contains(EventMask::DELETE_SELF) {
        condition |= Condition::DELETE;
    }
    if mask.contains(EventMask::MOVE_SELF) {
        condition |= Condition::RENAME;
    }
    condition
}

impl Registry {
    fn new(watches: Watches) -> Self {
        Registry {
            watches,
            next_token: 0,
            tokens: HashMap::new(),
            descriptors: HashMap::new(),
        }
    }

    fn open(&mut self, path: &Path) -> WatchToken {
        let token = WatchToken(self.next_token);
        self.next_token += 1;
        self.tokens.insert(
            token,
            Registration {
                path: path.to_path_buf(),
                descriptor: None,
                condition: Condition::empty(),
            },
        );
        token
    }

    fn register(&mut self, token: WatchToken, condition: Condition) -> io::Result<()> {
        let registration = self
            .tokens
            .get_mut(&token)
            .ok_or_else(|| unknown_token(token))?;

        log::trace!("adding inotify watch: {}", registration.path.display());

        // Other tokens may share the descriptor; never narrow their mask. Conditions are
        // filtered per token when events are fanned out.
        let descriptor = self
            .watches
            .add(&registration.path, watch_mask(condition) | WatchMask::MASK_ADD)?;
        registration.condition = condition;

        let previous = registration.descriptor.replace(descriptor.clone());
        if previous.as_ref() != Some(&descriptor) {
            if let Some(previous) = previous {
                detach(&mut self.descriptors, &previous, token);
            }
            self.descriptors.entry(descriptor).or_default().push(token);
        }
        Ok(())
    }

    fn deregister(&mut self, token: WatchToken) -> io::Result<()> {
        let registration = self
            .tokens
            .get_mut(&token)
            .ok_or_else(|| unknown_token(token))?;

        log::trace!("removing inotify watch: {}", registration.path.display());

        let Some(descriptor) = registration.descriptor.take() else {
            // never registered, or the kernel already dropped the watch
            return Ok(());
        };
        if detach(&mut self.descriptors, &descriptor, token) {
            self.watches.remove(descriptor)?;
        }
        Ok(())
    }

    fn close(&mut self, token: WatchToken) -> io::Result<()> {
        let registration = self
            .tokens
            .remove(&token)
            .ok_or_else(|| unknown_token(token))?;
        if let Some(descriptor) = registration.descriptor {
            if detach(&mut self.descriptors, &descriptor, token) {
                self.watches.remove(descriptor)?;
            }
        }
        Ok(())
    }

    /// The kernel dropped `descriptor` (IN_IGNORED): its inode is gone or it was removed.
    fn retire(&mut self, descriptor: &WatchDescriptor) {
        for token in self.descriptors.remove(descriptor).unwrap_or_default() {
            if let Some(registration) = self.tokens.get_mut(&token) {
                registration.descriptor = None;
            }
        }
    }

    fn fan_out(
        &self,
        descriptor: &WatchDescriptor,
        condition: Condition,
        batch: &mut Batch<WatchToken>,
    ) {
        let Some(tokens) = self.descriptors.get(descriptor) else {
            log::debug!("inotify event with unknown descriptor: {descriptor:?}");
            return;
        };
        for token in tokens {
            let registered = self
                .tokens
                .get(token)
                .map(|registration| registration.condition)
                .unwrap_or_default();
            let condition = condition & registered;
            if condition.contains(Condition::DELETE) {
                // unlinking changed the link count first, a vnode filter doesn't report that
                batch.retract(*token, Condition::ATTRIB);
            }
            if !condition.is_empty() {
                batch.push(RawEvent::new(*token, condition));
            }
        }
    }
}

/// Removes `token` from the descriptor's token list. Returns true if it was the last one.
fn detach(
    descriptors: &mut HashMap<WatchDescriptor, Vec<WatchToken>>,
    descriptor: &WatchDescriptor,
    token: WatchToken,
) -> bool {
    let Some(tokens) = descriptors.get_mut(descriptor) else {
        return false;
    };
    tokens.retain(|t| *t != token);
    if tokens.is_empty() {
        descriptors.remove(descriptor);
        true
    } else {
        false
    }
}

impl InotifyBackend {
    fn drain(&mut self, batch: &mut Batch<WatchToken>) -> io::Result<()> {
        loop {
            match self.inotify.read_events(&mut self.buffer) {
                Ok(events) => {
                    let mut guard = self.shared.registry();
                    let Some(registry) = guard.as_mut() else {
                        return Err(queue_closed());
                    };

                    let mut num_events = 0;
                    for event in events {
                        log::trace!("inotify event: {event:?}");
                        num_events += 1;

                        if event.mask.contains(EventMask::Q_OVERFLOW) {
                            log::warn!("inotify queue overflowed, events were lost");
                            batch.push_error(queue_overflowed());
                            continue;
                        }
                        if event.mask.contains(EventMask::IGNORED) {
                            registry.retire(&event.wd);
                            continue;
                        }

                        let condition = condition_of(event.mask, event.name.is_some());
                        if !condition.is_empty() {
                            registry.fan_out(&event.wd, condition, batch);
                        }
                    }

                    // All events read. Break out.
                    if num_events == 0 {
                        break;
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    // No events read. Break out.
                    break;
                }
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }
}

impl Backend for InotifyBackend {
    type Handle = WatchToken;
    type Registrar = InotifyRegistrar;

    fn open_queue(config: &Config) -> io::Result<(Self, Self::Registrar)> {
        let inotify = Inotify::init()?;
        let poll = mio::Poll::new()?;
        let waker = mio::Waker::new(poll.registry(), SHUTDOWN)?;

        let inotify_fd = inotify.as_raw_fd();
        let mut evented_inotify = mio::unix::SourceFd(&inotify_fd);
        poll.registry()
            .register(&mut evented_inotify, INOTIFY, mio::Interest::READABLE)?;

        let shared = Arc::new(Shared {
            waker,
            registry: Mutex::new(Some(Registry::new(inotify.watches()))),
        });

        // room for at least one event with a maximal name
        let min_buffer = std::mem::size_of::<libc::inotify_event>() + NAME_MAX + 1;
        let buffer = vec![0; config.read_buffer_size().max(min_buffer)];

        let backend = InotifyBackend {
            poll,
            events: mio::Events::with_capacity(16),
            inotify,
            buffer,
            shared: Arc::clone(&shared),
        };
        Ok((backend, InotifyRegistrar { shared }))
    }

    fn wait(&mut self, batch: &mut Batch<WatchToken>) -> io::Result<Wakeup> {
        self.poll.poll(&mut self.events, None)?;

        let mut wakeup = Wakeup::Ready;
        let mut readable = false;
        for event in &self.events {
            match event.token() {
                SHUTDOWN => wakeup = Wakeup::Shutdown,
                INOTIFY => readable = true,
                token => log::debug!("unexpected mio token {token:?}"),
            }
        }

        if readable {
            self.drain(batch)?;
        }
        Ok(wakeup)
    }

    fn close_queue(self) -> io::Result<()> {
        // retire the registrar before the descriptor number can be reused
        self.shared.registry().take();
        drop(self.poll);
        self.inotify.close()
    }
}

impl Registrar for InotifyRegistrar {
    type Handle = WatchToken;

    fn open_handle(&self, path: &Path) -> io::Result<WatchToken> {
        let mut guard = self.shared.registry();
        let registry = guard.as_mut().ok_or_else(queue_closed)?;
        Ok(registry.open(path))
    }

    fn register(&self, handle: WatchToken, condition: Condition) -> io::Result<()> {
        let mut guard = self.shared.registry();
        let registry = guard.as_mut().ok_or_else(queue_closed)?;
        registry.register(handle, condition)
    }

    fn deregister(&self, handle: WatchToken) -> io::Result<()> {
        let mut guard = self.shared.registry();
        let registry = guard.as_mut().ok_or_else(queue_closed)?;
        registry.deregister(handle)
    }

    fn close_handle(&self, handle: WatchToken) -> io::Result<()> {
        let mut guard = self.shared.registry();
        let registry = guard.as_mut().ok_or_else(queue_closed)?;
        registry.close(handle)
    }

    fn trigger_shutdown(&self) -> io::Result<()> {
        self.shared.waker.wake()
    }
}

impl fmt::Debug for InotifyBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InotifyBackend")
            .field("inotify", &self.inotify.as_raw_fd())
            .finish_non_exhaustive()
    }
}

impl fmt::Debug for InotifyRegistrar {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let guard = self.shared.registry();
        f.debug_struct("InotifyRegistrar")
            .field("closed", &guard.is_none())
            .field("handles", &guard.as_ref().map_or(0, |r| r.tokens.len()))
            .finish()
    }
}
