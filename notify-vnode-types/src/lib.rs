//! Types shared by `notify-vnode` and its consumers.

pub mod event;
