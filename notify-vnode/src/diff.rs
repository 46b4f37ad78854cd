//! Synthesis of create events from directory listings.
//!
//! A directory watch only reports that an entry was added or removed. The new entry is found by
//! listing the directory and comparing the names against the ones known from the previous listing.

use std::collections::HashSet;
use std::fs;
use std::io;
use std::path::Path;

use notify_vnode_types::event::Event;

use crate::backend::Registrar;
use crate::sink::Emitter;
use crate::table::Provenance;
use crate::watcher::{is_unreadable, is_vanished, Inner};
use crate::Error;

pub(crate) struct DiffEngine<'a, R: Registrar> {
    inner: &'a Inner<R>,
    emitter: &'a Emitter,
}

impl<'a, R: Registrar> DiffEngine<'a, R> {
    pub(crate) fn new(inner: &'a Inner<R>, emitter: &'a Emitter) -> Self {
        DiffEngine { inner, emitter }
    }

    /// Reports every child of `dir` that wasn't there at the last listing, watches it, and
    /// remembers the new listing.
    pub(crate) fn diff(&self, dir: &Path) {
        let names = match list(dir) {
            Ok(names) => names,
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                // its own removal is on the way
                log::debug!("directory vanished before listing: {}", dir.display());
                return;
            }
            Err(err) => {
                self.emitter.error(Error::io(err).add_path(dir.to_path_buf()));
                return;
            }
        };

        for name in &names {
            if !self.inner.is_watched(dir) {
                return;
            }
            self.create_if_new(&dir.join(name), Provenance::Implicit);
        }

        self.inner.table().replace_children(dir, names);
    }

    /// Reports `path` as created unless it is a known child of its parent, then watches it.
    ///
    /// Failures because the path vanished again, is unreadable or the watcher is closing are
    /// ignored; anything else is sent to the error sink.
    pub(crate) fn create_if_new(&self, path: &Path, provenance: Provenance) {
        if !self.inner.table().is_known(path) && !self.emitter.event(Event::create(path)) {
            return;
        }

        match self.inner.add_watch(path, provenance) {
            Ok(_) => {}
            Err(err) if is_vanished(&err) => return,
            Err(err) if is_unreadable(&err) => {
                log::debug!("not watching unreadable path: {err}");
            }
            Err(err) => {
                self.emitter.error(err);
                return;
            }
        }
        self.inner.table().remember(path);
    }
}

fn list(dir: &Path) -> io::Result<HashSet<std::ffi::OsString>> {
    fs::read_dir(dir)?
        .map(|entry| entry.map(|entry| entry.file_name()))
        .collect()
}
