//! File system notification with kqueue-style, per-vnode watches
//!
//! # Installation
//!
//! ```toml
//! [dependencies]
//! notify-vnode = "0.1.0"
//! ```
//!
//! ## Features
//!
//! - `serde` for serialization of events
//!
//! # How it works
//!
//! Every watched path gets its own kernel registration. The kernel only reports coarse
//! conditions for it (written, deleted, renamed, attributes changed), so for a watched directory
//! it says that *something* in it changed, never which child. The [`Watcher`] fills in the rest:
//!
//! - a new child is found by listing the directory and comparing it with the names it knew, and
//!   is reported as [`Op::CREATE`],
//! - every child of a watched directory is watched as well (a child directory only for its own
//!   removal), so writes to, and removal of, a child are reported for the child itself,
//! - a watched file that is replaced by another one under the same name (`mv new old`, the way
//!   many editors save) is reported as removed, then created.
//!
//! Watches are not recursive: the children of a child directory are not watched.
//!
//! # Examples
//!
//! ```no_run
//! use notify_vnode::{Op, Watcher};
//!
//! fn main() -> notify_vnode::Result<()> {
//!     let watcher = Watcher::new()?;
//!
//!     // Add a path to be watched. A directory reports changes to its children.
//!     watcher.add("/tmp/watched")?;
//!
//!     for event in watcher.events() {
//!         if event.op.contains(Op::CREATE) {
//!             println!("created: {:?}", event.path);
//!         }
//!     }
//!
//!     Ok(())
//! }
//! ```
//!
//! Events are handed over one at a time by default: the dispatch loop waits until a consumer
//! receives each one. [`Config::with_event_capacity`] lets it run ahead instead.
//!
//! ```no_run
//! # use notify_vnode::{Config, Watcher};
//! # fn main() -> notify_vnode::Result<()> {
//! let watcher = Watcher::with_config(Config::default().with_event_capacity(256))?;
//! watcher.add("/tmp/watched")?;
//!
//! std::thread::spawn(move || {
//!     for error in watcher.errors() {
//!         eprintln!("watch error: {error}");
//!     }
//! });
//! # Ok(())
//! # }
//! ```
//!
//! # Backends
//!
//! kqueue is used on the BSDs, macOS and iOS. On Linux and Android, inotify is used, reduced to
//! what kqueue reports, so the behaviour is the same everywhere. Other platforms are not
//! supported.
//!
//! # Known Problems
//!
//! ### Symlinks
//!
//! A watched symlink is resolved when it is added and the target is watched and reported under
//! its own path. A symlink that can't be resolved is ignored. Symlink loops are not detected
//! beyond what resolving the link reports.
//!
//! ### Linux: No space left on device
//!
//! This may be the case of running into the max-files watched limits of your user or system.
//! Every child of a watched directory counts towards the limit. It is reported as
//! [`ErrorKind::MaxFilesWatch`].
//!
//! ```sh
//! sudo sysctl fs.inotify.max_user_watches=524288 # example number
//! ```
//!
//! On kqueue, every watch is an open file descriptor, so the limit of open files of the process
//! applies instead.

#![deny(missing_docs)]

#[cfg(not(any(
    target_os = "linux",
    target_os = "android",
    target_os = "freebsd",
    target_os = "openbsd",
    target_os = "netbsd",
    target_os = "dragonfly",
    target_os = "ios",
    target_os = "macos"
)))]
compile_error!("notify-vnode supports Linux, Android, the BSDs, macOS and iOS");

pub use config::Config;
pub use error::{Error, ErrorKind, Result};
pub use notify_vnode_types::event::{self, Event, Op};
pub use watcher::{recommended_watcher, Watcher};

pub mod backend;
mod config;
mod diff;
mod dispatch;
mod error;
mod path;
mod sink;
mod table;
mod watcher;

#[cfg(test)]
pub(crate) mod test;
