//! The watch table, shared by the consumer threads and the dispatch loop.
//!
//! Every mutation happens under the single lock the table is stored behind. Nothing in here does
//! I/O, so the lock is never held across a syscall.

use std::collections::{HashMap, HashSet};
use std::ffi::OsString;
use std::path::{Path, PathBuf};

use crate::backend::{Condition, Handle};

/// Who asked for a watch.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub(crate) enum Provenance {
    /// Created by the engine for a child of a watched directory.
    Implicit,
    /// Requested by the consumer.
    Explicit,
}

impl Provenance {
    /// Conditions a watch of this provenance is registered for.
    pub(crate) fn condition(self, is_dir: bool) -> Condition {
        match (self, is_dir) {
            (Provenance::Implicit, true) => Condition::DIRECTORY_CHILD,
            _ => Condition::ALL_EVENTS,
        }
    }
}

/// Lifecycle of the watcher the table belongs to.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum State {
    Open,
    Closing,
    Closed,
}

/// One active kernel registration.
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) struct Watch<H> {
    pub(crate) path: PathBuf,
    pub(crate) handle: H,
    pub(crate) is_dir: bool,
    pub(crate) condition: Condition,
    pub(crate) provenance: Provenance,
}

/// Result of folding a new request into an existing watch.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct Merged<H> {
    pub(crate) handle: H,
    pub(crate) is_dir: bool,
    pub(crate) previous: Condition,
    pub(crate) condition: Condition,
}

impl<H> Merged<H> {
    /// The kernel registration has to be updated.
    pub(crate) fn widened(&self) -> bool {
        self.previous != self.condition
    }

    /// The directory just started to be watched for content changes.
    pub(crate) fn needs_priming(&self) -> bool {
        self.is_dir
            && !self.previous.contains(Condition::WRITE)
            && self.condition.contains(Condition::WRITE)
    }
}

#[derive(Debug)]
pub(crate) struct WatchTable<H> {
    state: State,
    dispatch_dead: bool,
    watches: HashMap<PathBuf, Watch<H>>,
    paths: HashMap<H, PathBuf>,
    children: HashMap<PathBuf, HashSet<OsString>>,
}

impl<H: Handle> WatchTable<H> {
    pub(crate) fn new() -> Self {
        WatchTable {
            state: State::Open,
            dispatch_dead: false,
            watches: HashMap::new(),
            paths: HashMap::new(),
            children: HashMap::new(),
        }
    }

    pub(crate) fn state(&self) -> State {
        self.state
    }

    /// New watches may only be created while open and while the dispatch loop is alive.
    pub(crate) fn accepts_watches(&self) -> bool {
        self.state == State::Open && !self.dispatch_dead
    }

    pub(crate) fn is_dispatch_dead(&self) -> bool {
        self.dispatch_dead
    }

    pub(crate) fn mark_dispatch_dead(&mut self) {
        self.dispatch_dead = true;
    }

    /// Moves an open table to [`State::Closing`] and hands out every watch for teardown.
    ///
    /// Returns `None` if the table is already closing or closed.
    pub(crate) fn begin_close(&mut self) -> Option<Vec<Watch<H>>> {
        if self.state != State::Open {
            return None;
        }
        self.state = State::Closing;
        self.paths.clear();
        self.children.clear();
        Some(self.watches.drain().map(|(_, watch)| watch).collect())
    }

    pub(crate) fn finish_close(&mut self) {
        self.state = State::Closed;
    }

    pub(crate) fn get(&self, path: &Path) -> Option<&Watch<H>> {
        self.watches.get(path)
    }

    pub(crate) fn contains(&self, path: &Path) -> bool {
        self.watches.contains_key(path)
    }

    /// Inserts a new watch. If `path` is already watched the table is left untouched and the
    /// watch is handed back.
    pub(crate) fn register(&mut self, watch: Watch<H>) -> Result<(), Watch<H>> {
        if self.watches.contains_key(&watch.path) {
            return Err(watch);
        }
        self.paths.insert(watch.handle, watch.path.clone());
        self.watches.insert(watch.path.clone(), watch);
        Ok(())
    }

    /// ORs `condition` into the watch on `path` and upgrades its provenance. Implicit requests
    /// never downgrade an explicit watch.
    pub(crate) fn merge(
        &mut self,
        path: &Path,
        condition: Condition,
        provenance: Provenance,
    ) -> Option<Merged<H>> {
        let watch = self.watches.get_mut(path)?;
        let previous = watch.condition;
        watch.condition |= condition;
        watch.provenance = watch.provenance.max(provenance);
        Some(Merged {
            handle: watch.handle,
            is_dir: watch.is_dir,
            previous,
            condition: watch.condition,
        })
    }

    /// Removes the watch on `path`, together with what is known about its children.
    pub(crate) fn unregister(&mut self, path: &Path) -> Option<Watch<H>> {
        let watch = self.watches.remove(path)?;
        self.paths.remove(&watch.handle);
        self.children.remove(path);
        Some(watch)
    }

    pub(crate) fn lookup_by_handle(&self, handle: H) -> Option<&Watch<H>> {
        self.paths.get(&handle).and_then(|path| self.watches.get(path))
    }

    /// Sorted snapshot of the explicitly watched paths.
    pub(crate) fn list(&self) -> Vec<PathBuf> {
        let mut paths: Vec<PathBuf> = self
            .watches
            .values()
            .filter(|watch| watch.provenance == Provenance::Explicit)
            .map(|watch| watch.path.clone())
            .collect();
        paths.sort();
        paths
    }

    /// Implicit watches whose parent directory is `dir`.
    pub(crate) fn implicit_children(&self, dir: &Path) -> Vec<PathBuf> {
        self.watches
            .values()
            .filter(|watch| {
                watch.provenance == Provenance::Implicit && watch.path.parent() == Some(dir)
            })
            .map(|watch| watch.path.clone())
            .collect()
    }

    /// Whether `path` was seen in the last listing of its parent directory. A parent that was
    /// never listed knows no children.
    pub(crate) fn is_known(&self, path: &Path) -> bool {
        match (path.parent(), path.file_name()) {
            (Some(dir), Some(name)) => self
                .children
                .get(dir)
                .is_some_and(|children| children.contains(name)),
            _ => false,
        }
    }

    /// Records `path` in its parent's known children, if the parent is watched.
    pub(crate) fn remember(&mut self, path: &Path) {
        if let (Some(dir), Some(name)) = (path.parent(), path.file_name()) {
            if self.watches.contains_key(dir) {
                self.children
                    .entry(dir.to_path_buf())
                    .or_default()
                    .insert(name.to_os_string());
            }
        }
    }

    pub(crate) fn forget(&mut self, path: &Path) {
        if let (Some(dir), Some(name)) = (path.parent(), path.file_name()) {
            if let Some(children) = self.children.get_mut(dir) {
                children.remove(name);
            }
        }
    }

    /// Replaces the known children of `dir` with a fresh listing, if `dir` is still watched.
    pub(crate) fn replace_children(&mut self, dir: &Path, names: HashSet<OsString>) {
        if self.watches.contains_key(dir) {
            self.children.insert(dir.to_path_buf(), names);
        }
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        debug_assert_eq!(self.watches.len(), self.paths.len());
        self.watches.len()
    }
}
