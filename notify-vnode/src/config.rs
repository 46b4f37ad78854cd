//! Configuration types

/// Watcher configuration
///
/// ```rust
/// # use notify_vnode::Config;
/// let config = Config::default()
///     .with_event_capacity(64)
///     .with_thread_name("my-app fs watcher");
/// ```
///
/// All options have to be set when creating the watcher.
#[derive(Copy, Clone, PartialEq, Eq, Debug, Hash)]
pub struct Config {
    /// See [Config::with_event_capacity]
    event_capacity: usize,

    /// See [Config::with_error_capacity]
    error_capacity: usize,

    /// See [Config::with_read_buffer_size]
    read_buffer_size: usize,

    thread_name: &'static str,
}

impl Config {
    /// Capacity of the event channel.
    ///
    /// With the default of `0` every event is handed over directly to a consumer blocked in
    /// `recv`, and the dispatch loop waits until that happens (or the watcher is closed). A larger
    /// capacity lets the dispatch loop run ahead of a slow consumer.
    pub fn with_event_capacity(mut self, capacity: usize) -> Self {
        self.event_capacity = capacity;
        self
    }

    /// Returns current setting
    pub fn event_capacity(&self) -> usize {
        self.event_capacity
    }

    /// Capacity of the error channel, see [`Config::with_event_capacity`].
    pub fn with_error_capacity(mut self, capacity: usize) -> Self {
        self.error_capacity = capacity;
        self
    }

    /// Returns current setting
    pub fn error_capacity(&self) -> usize {
        self.error_capacity
    }

    /// For the inotify backend.
    ///
    /// Size in bytes of the buffer kernel events are read into. Values below the size of a single
    /// inotify event with a maximal file name are raised to that size.
    pub fn with_read_buffer_size(mut self, size: usize) -> Self {
        self.read_buffer_size = size;
        self
    }

    /// Returns current setting
    pub fn read_buffer_size(&self) -> usize {
        self.read_buffer_size
    }

    /// Name of the dispatch loop thread.
    pub fn with_thread_name(mut self, name: &'static str) -> Self {
        self.thread_name = name;
        self
    }

    /// Returns current setting
    pub fn thread_name(&self) -> &'static str {
        self.thread_name
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            event_capacity: 0,
            error_capacity: 0,
            read_buffer_size: 4096,
            thread_name: "notify-vnode dispatch loop",
        }
    }
}
