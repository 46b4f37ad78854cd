//! The dispatch loop: the single thread that waits on the kernel queue, and the translation of
//! raw conditions into events with their cascading effects on the watch table.

use std::fs;
use std::io;
use std::path::Path;
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use notify_vnode_types::event::{Event, Op};

use crate::backend::{Backend, Batch, RawEvent, Registrar, Wakeup};
use crate::diff::DiffEngine;
use crate::sink::Emitter;
use crate::table::Provenance;
use crate::watcher::Inner;
use crate::Error;

/// Owns the kernel queue for its whole life, and closes it when it exits.
pub(crate) struct DispatchLoop<B: Backend> {
    backend: B,
    translator: Translator<B::Registrar>,
}

impl<B: Backend> DispatchLoop<B> {
    pub(crate) fn new(backend: B, inner: Arc<Inner<B::Registrar>>, emitter: Emitter) -> Self {
        DispatchLoop {
            backend,
            translator: Translator { inner, emitter },
        }
    }

    pub(crate) fn spawn(self, name: &str) -> io::Result<JoinHandle<()>> {
        thread::Builder::new()
            .name(name.to_string())
            .spawn(move || self.run())
    }

    fn run(self) {
        let DispatchLoop {
            mut backend,
            translator,
        } = self;
        let mut batch = Batch::new();

        loop {
            let result = backend.wait(&mut batch);

            // events already read are processed before anything else, shutdown included
            let (events, errors) = batch.take();
            for event in events {
                translator.handle(event);
            }
            for error in errors {
                if !translator.emitter.error(error) {
                    break;
                }
            }

            match result {
                Ok(Wakeup::Ready) => {}
                Ok(Wakeup::Shutdown) => break,
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => {
                    // System call was interrupted, we will retry
                }
                Err(e) => {
                    log::error!("waiting for kernel events failed: {e}");
                    translator.inner.table().mark_dispatch_dead();
                    translator.emitter.error(Error::io(e));
                    break;
                }
            }
        }

        if let Err(err) = backend.close_queue() {
            log::warn!("failed to close the kernel queue: {err}");
        }
        // dropping the translator disconnects the sinks
    }
}

/// Turns raw conditions into events and keeps the watch table in step with them.
pub(crate) struct Translator<R: Registrar> {
    pub(crate) inner: Arc<Inner<R>>,
    pub(crate) emitter: Emitter,
}

impl<R: Registrar> Translator<R> {
    fn differ(&self) -> DiffEngine<'_, R> {
        DiffEngine::new(&self.inner, &self.emitter)
    }

    pub(crate) fn handle(&self, raw: RawEvent<R::Handle>) {
        log::trace!("raw event: {raw:?}");

        let watch = self.inner.table().lookup_by_handle(raw.handle).cloned();
        let Some(watch) = watch else {
            log::debug!("dropping event for a handle no longer watched: {raw:?}");
            return;
        };

        let mut op = Op::from(raw.condition);
        // a directory removed between the notification and now
        if watch.is_dir && !op.contains(Op::REMOVE) && !exists(&watch.path) {
            op |= Op::REMOVE;
        }

        if op.is_removal() {
            if let Err(err) = self.inner.remove_watch(&watch.path) {
                log::debug!("watch already gone: {err}");
            }
            self.inner.table().forget(&watch.path);
        }

        if watch.is_dir && op.contains(Op::WRITE) && !op.contains(Op::REMOVE) {
            self.differ().diff(&watch.path);
        } else if !self.emitter.event(Event::new(watch.path.clone(), op)) {
            return;
        }

        if op.contains(Op::REMOVE) {
            self.recheck_removed(&watch.path, watch.is_dir, watch.provenance);
        }
    }

    /// Looks for something that replaced a removed path: `mv f1 f2` removes `f2`, then
    /// creates it.
    fn recheck_removed(&self, path: &Path, is_dir: bool, provenance: Provenance) {
        if is_dir {
            // During `rm -rf` the directory may be gone already. Its parent reports the removal.
            if self.inner.is_watched(path) && exists(path) {
                self.differ().diff(path);
            }
            return;
        }

        if !exists(path) {
            return;
        }
        let parent_watched = path
            .parent()
            .is_some_and(|parent| self.inner.is_watched(parent));
        if provenance == Provenance::Explicit || parent_watched {
            self.differ().create_if_new(path, provenance);
        }
    }
}

fn exists(path: &Path) -> bool {
    fs::symlink_metadata(path).is_ok()
}
