#![allow(dead_code)] // not every test file uses every helper

use std::{
    fs,
    path::{Path, PathBuf},
    thread,
    time::{Duration, Instant},
};

use crossbeam_channel::{Receiver, RecvTimeoutError};
use notify_vnode::{Event, Op};
use tempfile::TempDir;

pub const TIMEOUT: Duration = Duration::from_millis(500);

/// A temporary directory under its canonical path, so that it compares equal to the paths
/// events are reported under (`/var` is `/private/var` on macOS).
pub struct TestDir {
    _dir: TempDir,
    path: PathBuf,
}

impl TestDir {
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn join(&self, name: &str) -> PathBuf {
        self.path.join(name)
    }
}

pub fn testdir() -> TestDir {
    let dir = tempfile::tempdir().expect("Unable to create tempdir");
    let path = fs::canonicalize(dir.path()).expect("Unable to canonicalize tempdir");
    TestDir { _dir: dir, path }
}

/// Collects every event that arrives within `timeout`.
pub fn recv_events_with_timeout(rx: &Receiver<Event>, timeout: Duration) -> Vec<(PathBuf, Op)> {
    let deadline = Instant::now() + timeout;
    let mut events = Vec::new();
    loop {
        match rx.recv_deadline(deadline) {
            Ok(event) => events.push((event.path, event.op)),
            Err(RecvTimeoutError::Timeout) => break,
            Err(RecvTimeoutError::Disconnected) => panic!("the watcher was closed"),
        }
    }
    events
}

pub fn recv_events(rx: &Receiver<Event>) -> Vec<(PathBuf, Op)> {
    recv_events_with_timeout(rx, TIMEOUT)
}

/// Attribute changes are reported more or less often depending on the platform and the file
/// system; they are dropped before comparing.
pub fn without_chmod(events: Vec<(PathBuf, Op)>) -> Vec<(PathBuf, Op)> {
    events
        .into_iter()
        .filter_map(|(path, op)| {
            let op = op - Op::CHMOD;
            (!op.is_empty()).then_some((path, op))
        })
        .collect()
}

/// Waits for an event matching `path` and `op`, failing after `TIMEOUT`.
pub fn wait_for(rx: &Receiver<Event>, path: &Path, op: Op) -> Vec<(PathBuf, Op)> {
    let deadline = Instant::now() + TIMEOUT * 4;
    let mut seen = Vec::new();
    loop {
        match rx.recv_deadline(deadline) {
            Ok(event) => {
                let found = event.path == path && event.op.contains(op);
                seen.push((event.path, event.op));
                if found {
                    return seen;
                }
            }
            Err(e) => panic!("no {op} event for {path:?} ({e:?}), seen: {seen:#?}"),
        }
    }
}

/// Give the dispatch loop time to register the watch for a child it just reported.
pub fn settle() {
    thread::sleep(Duration::from_millis(100));
}
