//! The consumer-facing [`Watcher`] and the state it shares with its dispatch loop.

use std::collections::HashSet;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::JoinHandle;

use crossbeam_channel::{Receiver, Sender};
use notify_vnode_types::event::Event;

use crate::backend::{Backend, Condition, RecommendedBackend, Registrar};
use crate::dispatch::DispatchLoop;
use crate::path::{self, Admission};
use crate::sink::{Emitter, Sinks};
use crate::table::{Provenance, Watch, WatchTable};
use crate::{Config, Error, ErrorKind, Result};

/// State shared by every consumer thread and the dispatch loop.
pub(crate) struct Inner<R: Registrar> {
    pub(crate) registrar: R,
    table: Mutex<WatchTable<R::Handle>>,
}

/// A watch that was created or widened by [`Inner::add_watch`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Added {
    /// The resolved path the watch is registered under.
    pub(crate) path: PathBuf,
    pub(crate) is_dir: bool,
    /// Whether the directory has to be primed: it just started to be watched for writes.
    pub(crate) prime: bool,
}

impl<R: Registrar> Inner<R> {
    pub(crate) fn new(registrar: R) -> Self {
        Inner {
            registrar,
            table: Mutex::new(WatchTable::new()),
        }
    }

    pub(crate) fn table(&self) -> MutexGuard<'_, WatchTable<R::Handle>> {
        // the table is consistent after every single mutation
        self.table.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn is_watched(&self, path: &Path) -> bool {
        self.table().contains(path)
    }

    /// Admits and registers a watch on `path`, an absolute and cleaned path.
    ///
    /// Returns `None` if the path was declined (sockets, named pipes, unresolvable symlinks).
    /// An already watched path gets its conditions widened instead of a second kernel handle.
    pub(crate) fn add_watch(&self, path: &Path, provenance: Provenance) -> Result<Option<Added>> {
        if !self.table().accepts_watches() {
            return Err(Error::closed().add_path(path.to_path_buf()));
        }

        let (path, is_dir) = match path::admit(path)
            .map_err(|e| Error::io_watch(e).add_path(path.to_path_buf()))?
        {
            Admission::Decline => return Ok(None),
            Admission::Watch { path, is_dir } => (path, is_dir),
        };
        let condition = provenance.condition(is_dir);

        let merged = self.table().merge(&path, condition, provenance);
        if let Some(merged) = merged {
            if merged.widened() {
                self.registrar
                    .register(merged.handle, merged.condition)
                    .map_err(|e| Error::io_watch(e).add_path(path.clone()))?;
            }
            return Ok(Some(Added {
                prime: merged.needs_priming(),
                is_dir: merged.is_dir,
                path,
            }));
        }

        log::trace!("adding watch: {} ({condition:?})", path.display());

        let handle = self
            .registrar
            .open_handle(&path)
            .map_err(|e| Error::io_watch(e).add_path(path.clone()))?;
        if let Err(err) = self.registrar.register(handle, condition) {
            if let Err(err) = self.registrar.close_handle(handle) {
                log::debug!("failed to close handle for {}: {err}", path.display());
            }
            return Err(Error::io_watch(err).add_path(path));
        }

        let mut table = self.table();
        if !table.accepts_watches() {
            // closed while the handle was being opened
            drop(table);
            self.release(handle, &path);
            return Err(Error::closed().add_path(path));
        }
        let watch = Watch {
            path: path.clone(),
            handle,
            is_dir,
            condition,
            provenance,
        };
        match table.register(watch) {
            Ok(()) => Ok(Some(Added {
                prime: is_dir && condition.contains(Condition::WRITE),
                is_dir,
                path,
            })),
            Err(_) => {
                // another thread registered the same path in the meantime: fold into its watch
                let merged = table.merge(&path, condition, provenance);
                drop(table);
                self.release(handle, &path);

                let Some(merged) = merged else {
                    return Ok(None);
                };
                if merged.widened() {
                    self.registrar
                        .register(merged.handle, merged.condition)
                        .map_err(|e| Error::io_watch(e).add_path(path.clone()))?;
                }
                Ok(Some(Added {
                    prime: merged.needs_priming(),
                    is_dir: merged.is_dir,
                    path,
                }))
            }
        }
    }

    /// Watches every existing child of `dir` and seeds its known children.
    ///
    /// Children that vanished or can't be read are skipped; any other failure is returned.
    pub(crate) fn prime(&self, dir: &Path) -> Result<()> {
        let entries =
            fs::read_dir(dir).map_err(|e| Error::io_watch(e).add_path(dir.to_path_buf()))?;

        let mut names = HashSet::new();
        for entry in entries {
            let entry = entry.map_err(|e| Error::io(e).add_path(dir.to_path_buf()))?;
            let child = dir.join(entry.file_name());
            match self.add_watch(&child, Provenance::Implicit) {
                Ok(_) => {}
                Err(err) if is_vanished(&err) => continue,
                Err(err) if is_unreadable(&err) => {
                    log::debug!("skipping unreadable child: {err}");
                }
                Err(err) => return Err(err),
            }
            names.insert(entry.file_name());
        }

        self.table().replace_children(dir, names);
        Ok(())
    }

    /// Removes the watch on `path` and, for a directory, the implicit watches of its children.
    ///
    /// Kernel-level failures while tearing down are logged, never returned.
    pub(crate) fn remove_watch(&self, path: &Path) -> Result<()> {
        let watch = self
            .table()
            .unregister(path)
            .ok_or_else(|| Error::watch_not_found().add_path(path.to_path_buf()))?;

        log::trace!("removing watch: {}", path.display());
        self.release(watch.handle, &watch.path);

        if watch.is_dir {
            let children = self.table().implicit_children(&watch.path);
            for child in children {
                if let Err(err) = self.remove_watch(&child) {
                    log::warn!("failed to remove implicit watch: {err}");
                }
            }
        }
        Ok(())
    }

    /// Deregisters and closes a handle that is no longer in the table.
    pub(crate) fn release(&self, handle: R::Handle, path: &Path) {
        if let Err(err) = self.registrar.deregister(handle) {
            log::debug!("failed to deregister {}: {err}", path.display());
        }
        if let Err(err) = self.registrar.close_handle(handle) {
            log::debug!("failed to close handle for {}: {err}", path.display());
        }
    }
}

/// The child disappeared before it could be watched, or the watcher is going away.
pub(crate) fn is_vanished(err: &Error) -> bool {
    matches!(err.kind, ErrorKind::PathNotFound | ErrorKind::Closed)
}

/// No permission to watch the child: not a problem, it is just skipped.
pub(crate) fn is_unreadable(err: &Error) -> bool {
    matches!(&err.kind, ErrorKind::Io(e) if e.kind() == io::ErrorKind::PermissionDenied)
}

/// Watches paths with per-vnode kernel watches and reports [`Event`]s for them.
///
/// Watching a directory reports changes to its direct children: creation is detected by diffing
/// the directory's listing, everything else comes from a watch the engine registers on each child.
/// Directories are never watched recursively.
///
/// All methods take `&self`, a watcher can be shared between threads. Dropping it closes it.
///
/// ```no_run
/// # fn main() -> notify_vnode::Result<()> {
/// use notify_vnode::Watcher;
///
/// let watcher = Watcher::new()?;
/// watcher.add("/tmp")?;
///
/// for event in watcher.events() {
///     println!("{event}");
/// }
/// # Ok(())
/// # }
/// ```
pub struct Watcher<B: Backend = RecommendedBackend> {
    inner: Arc<Inner<B::Registrar>>,
    events: Receiver<Event>,
    errors: Receiver<Error>,
    done: Mutex<Option<Sender<()>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl Watcher {
    /// Creates a watcher on the [`RecommendedBackend`] with the default [`Config`].
    pub fn new() -> Result<Self> {
        Self::with_config(Config::default())
    }

    /// Creates a watcher on the [`RecommendedBackend`].
    pub fn with_config(config: Config) -> Result<Self> {
        Self::with_backend(config)
    }
}

impl<B: Backend> Watcher<B> {
    /// Creates a watcher on the backend `B`.
    ///
    /// Opens the kernel queue and starts the dispatch loop thread.
    pub fn with_backend(config: Config) -> Result<Self> {
        let (backend, registrar) = B::open_queue(&config)?;
        let inner = Arc::new(Inner::new(registrar));
        let (emitter, sinks) = Emitter::new(config.event_capacity(), config.error_capacity());
        let Sinks {
            events,
            errors,
            done,
        } = sinks;

        let worker = DispatchLoop::new(backend, Arc::clone(&inner), emitter)
            .spawn(config.thread_name())?;

        Ok(Watcher {
            inner,
            events,
            errors,
            done: Mutex::new(Some(done)),
            worker: Mutex::new(Some(worker)),
        })
    }

    /// Starts watching `path`.
    ///
    /// A directory is watched for changes to its direct children; every child that exists right
    /// now is watched as well. Adding a path that is already watched is not an error.
    ///
    /// Sockets and named pipes are silently ignored, and so is a symlink that can't be resolved.
    /// A symlink that can be resolved is watched, and reported, under its target.
    pub fn add<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path::absolutize(path.as_ref()).map_err(Error::io)?;
        if let Some(added) = self.inner.add_watch(&path, Provenance::Explicit)? {
            if added.prime {
                self.inner.prime(&added.path)?;
            }
        }
        Ok(())
    }

    /// Stops watching `path`.
    ///
    /// Removing a directory also removes the watches the engine added for its children. Returns
    /// an [`ErrorKind::WatchNotFound`] error if the path isn't watched.
    pub fn remove<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path::absolutize(path.as_ref()).map_err(Error::io)?;
        match self.inner.remove_watch(&path) {
            Err(err) if matches!(err.kind, ErrorKind::WatchNotFound) => {
                // a watched symlink is registered under its target
                match fs::canonicalize(&path) {
                    Ok(target) if target != path => self.inner.remove_watch(&target),
                    _ => Err(err),
                }
            }
            result => result,
        }
    }

    /// Returns the explicitly watched paths, sorted.
    pub fn watch_list(&self) -> Vec<PathBuf> {
        self.inner.table().list()
    }

    /// The event sink.
    ///
    /// Disconnected once the watcher is closed, or when the dispatch loop died.
    pub fn events(&self) -> &Receiver<Event> {
        &self.events
    }

    /// The error sink, for errors that happen while dispatching events.
    pub fn errors(&self) -> &Receiver<Error> {
        &self.errors
    }

    /// Removes every watch, stops the dispatch loop and waits for it to exit.
    ///
    /// Closing is idempotent and may be called concurrently from any number of threads; only the
    /// first call does the work. It doesn't wait for the event sink to be drained: an event the
    /// consumer never receives is dropped.
    pub fn close(&self) -> Result<()> {
        let Some(watches) = self.inner.table().begin_close() else {
            return Ok(());
        };

        for watch in watches {
            self.inner.release(watch.handle, &watch.path);
        }

        if let Err(err) = self.inner.registrar.trigger_shutdown() {
            // a dispatch loop that died on its own doesn't need the signal
            if !self.inner.table().is_dispatch_dead() {
                log::error!("failed to trigger the shutdown signal: {err}");
                return Err(Error::io(err));
            }
            log::debug!("no shutdown signal for a dead dispatch loop: {err}");
        }

        // interrupts a hand-off blocked on an absent consumer
        lock(&self.done).take();

        if let Some(worker) = lock(&self.worker).take() {
            if worker.join().is_err() {
                log::error!("the dispatch loop thread panicked");
            }
        }

        self.inner.table().finish_close();
        Ok(())
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl<B: Backend> Drop for Watcher<B> {
    fn drop(&mut self) {
        if let Err(err) = self.close() {
            log::error!("failed to close the watcher: {err}");
        }
    }
}

impl<B: Backend> std::fmt::Debug for Watcher<B> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let (state, watches) = {
            let table = self.inner.table();
            (table.state(), table.list())
        };
        f.debug_struct("Watcher")
            .field("state", &state)
            .field("watches", &watches)
            .finish_non_exhaustive()
    }
}

/// Convenience method for creating the [`Watcher`] for the current platform.
pub fn recommended_watcher() -> Result<Watcher> {
    Watcher::new()
}
