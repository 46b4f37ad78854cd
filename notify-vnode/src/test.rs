#![allow(dead_code)] // not all helpers are used for all targets

use std::{
    cell::RefCell,
    collections::{HashMap, VecDeque},
    fs, io,
    path::{Path, PathBuf},
    sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError},
    thread,
    time::{Duration, Instant},
};

use crossbeam_channel::RecvTimeoutError;
use notify_vnode_types::event::Event;

use crate::backend::{Backend, Batch, Condition, RawEvent, Registrar, Wakeup};
use crate::{Config, Error, Watcher};

pub use expect::*;

/// Waits for events from a watcher and provides with some helper methods
pub struct EventReceiver {
    pub rx: crossbeam_channel::Receiver<Event>,
    pub errors: crossbeam_channel::Receiver<Error>,
    pub timeout: Duration,
}

impl EventReceiver {
    const DEFAULT_TIMEOUT: Duration = Duration::from_secs(1);

    pub fn new<B: Backend>(watcher: &Watcher<B>) -> Self {
        Self {
            rx: watcher.events().clone(),
            errors: watcher.errors().clone(),
            timeout: Self::DEFAULT_TIMEOUT,
        }
    }

    fn wait_expected<C: ExpectedEvents>(&mut self, mut state: ExpectedState<C>) -> Vec<Event> {
        while !state.is_empty() {
            match self.try_recv() {
                Ok(event) => state.check(event),
                Err(e) => panic!("Recv error: {e:?}. State: {state:#?}"),
            }
        }
        state.into_received()
    }

    /// Waits for the events in the same order as they provided and fails on an unexpected one.
    pub fn wait_ordered_exact(
        &mut self,
        expected: impl IntoIterator<Item = ExpectedEvent>,
    ) -> Vec<Event> {
        self.wait_expected(ExpectedState::ordered(expected).disallow_unexpected())
    }

    /// Waits for the events in the same order as they provided and ignores unexpected ones.
    pub fn wait_ordered(&mut self, expected: impl IntoIterator<Item = ExpectedEvent>) -> Vec<Event> {
        self.wait_expected(ExpectedState::ordered(expected).allow_unexpected())
    }

    /// Waits for the events in any order and fails on an unexpected one.
    pub fn wait_unordered_exact(
        &mut self,
        expected: impl IntoIterator<Item = ExpectedEvent>,
    ) -> Vec<Event> {
        self.wait_expected(ExpectedState::unordered(expected).disallow_unexpected())
    }

    /// Waits for the events in any order and ignores unexpected ones.
    pub fn wait_unordered(
        &mut self,
        expected: impl IntoIterator<Item = ExpectedEvent>,
    ) -> Vec<Event> {
        self.wait_expected(ExpectedState::unordered(expected).allow_unexpected())
    }

    pub fn try_recv(&mut self) -> Result<Event, RecvTimeoutError> {
        if let Ok(err) = self.errors.try_recv() {
            panic!("Got an error from the watcher: {err:?}");
        }
        self.rx.recv_timeout(self.timeout)
    }

    pub fn recv(&mut self) -> Event {
        self.try_recv().unwrap_or_else(|e| match e {
            RecvTimeoutError::Timeout => panic!("Unable to wait the next event: timeout"),
            RecvTimeoutError::Disconnected => {
                panic!("Unable to wait the next event: the watcher was closed")
            }
        })
    }

    /// Ensures nothing arrives for `duration`
    pub fn ensure_empty_for(&mut self, duration: Duration) {
        match self.rx.recv_timeout(duration) {
            Ok(event) => panic!("Unexpected event was received: {event:#?}"),
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => panic!("The watcher was closed"),
        }
    }

    /// Ensures the watcher side of the channel was closed, after draining what was left
    pub fn ensure_disconnected(&mut self) {
        let deadline = Instant::now() + self.timeout;
        loop {
            match self.rx.recv_deadline(deadline) {
                Ok(_) => continue,
                Err(RecvTimeoutError::Disconnected) => return,
                Err(RecvTimeoutError::Timeout) => {
                    panic!("The event channel is still connected after {:?}", self.timeout)
                }
            }
        }
    }
}

/// Calls the provided closure
/// * If it returned true, returns true
/// * If it returned false, waits for a short period and tries again
/// * If the timeout was reached, returns false
#[must_use]
pub fn sleep_until<F: FnMut() -> bool>(mut check: F, timeout: Duration) -> bool {
    let start = Instant::now();
    loop {
        if check() {
            return true;
        }
        if start.elapsed() > timeout {
            return false;
        }
        thread::sleep(Duration::from_millis(10));
    }
}

/// This is a canonicalized path due to macos behaviour - it creates
/// a dir with path '/var/...' but actually it is '/private/var/...'
///
/// Watches are registered under resolved paths, so the expected paths have to be resolved too
pub struct TestDir {
    _dir: tempfile::TempDir,

    path: PathBuf,
}

impl TestDir {
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl AsRef<Path> for TestDir {
    fn as_ref(&self) -> &Path {
        self.path()
    }
}

/// Creates a [`TestDir`]
pub fn testdir() -> TestDir {
    let dir = tempfile::tempdir().expect("Unable to create tempdir");
    let path = fs::canonicalize(dir.path()).unwrap_or_else(|e| {
        panic!(
            "unable to canonicalize tempdir path {:?}: {e:?}",
            dir.path()
        )
    });
    TestDir { _dir: dir, path }
}

/// What the [`ScriptedBackend`] does on its next wait.
#[derive(Debug)]
enum Step {
    Event(RawEvent<u32>),
    Error(Error),
    Fail(io::ErrorKind),
}

#[derive(Debug, Default)]
struct ScriptState {
    steps: VecDeque<Step>,
    shutdown: bool,
    queue_closed: bool,
    fail_deregister: bool,
    next_handle: u32,
    opened: usize,
    handles: HashMap<u32, PathBuf>,
    registered: HashMap<u32, Condition>,
}

/// Shared state of an in-memory backend, driven by the test.
#[derive(Debug, Default)]
pub struct Script {
    state: Mutex<ScriptState>,
    changed: Condvar,
}

impl Script {
    fn state(&self) -> MutexGuard<'_, ScriptState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn update(&self, f: impl FnOnce(&mut ScriptState)) {
        f(&mut self.state());
        self.changed.notify_all();
    }

    /// Makes the backend report `condition` for `handle`.
    pub fn push(&self, handle: u32, condition: Condition) {
        self.update(|s| s.steps.push_back(Step::Event(RawEvent::new(handle, condition))));
    }

    /// Reports an event and fires the shutdown signal, so both arrive in a single wait.
    pub fn push_then_shutdown(&self, handle: u32, condition: Condition) {
        self.update(|s| {
            s.steps.push_back(Step::Event(RawEvent::new(handle, condition)));
            s.shutdown = true;
        });
    }

    /// Makes the backend report an error that doesn't end the wait.
    pub fn push_error(&self, error: Error) {
        self.update(|s| s.steps.push_back(Step::Error(error)));
    }

    /// Makes the next wait fail.
    pub fn fail_wait(&self, kind: io::ErrorKind) {
        self.update(|s| s.steps.push_back(Step::Fail(kind)));
    }

    pub fn fail_deregister(&self) {
        self.update(|s| s.fail_deregister = true);
    }

    /// The open handle for `path`, if any.
    pub fn handle_of(&self, path: impl AsRef<Path>) -> Option<u32> {
        let path = path.as_ref();
        self.state()
            .handles
            .iter()
            .find(|(_, p)| p.as_path() == path)
            .map(|(handle, _)| *handle)
    }

    /// Waits until a handle for `path` was opened.
    pub fn await_handle(&self, path: impl AsRef<Path>) -> u32 {
        let path = path.as_ref();
        let mut handle = None;
        let found = sleep_until(
            || {
                handle = self.handle_of(path);
                handle.is_some()
            },
            Duration::from_secs(1),
        );
        assert!(found, "no handle was opened for {path:?}");
        handle.unwrap_or_default()
    }

    /// Number of handles ever opened.
    pub fn opened(&self) -> usize {
        self.state().opened
    }

    pub fn open_handles(&self) -> usize {
        self.state().handles.len()
    }

    pub fn registered(&self) -> HashMap<u32, Condition> {
        self.state().registered.clone()
    }

    pub fn queue_closed(&self) -> bool {
        self.state().queue_closed
    }

    pub fn wait_for_queue_closed(&self) -> bool {
        let guard = self.state();
        let (guard, _) = self
            .changed
            .wait_timeout_while(guard, Duration::from_secs(1), |s| !s.queue_closed)
            .unwrap_or_else(PoisonError::into_inner);
        guard.queue_closed
    }
}

/// In-memory [`Backend`]: waits are answered from the [`Script`].
#[derive(Debug)]
pub struct ScriptedBackend {
    script: Arc<Script>,
}

/// [`Registrar`] of the [`ScriptedBackend`]
#[derive(Debug)]
pub struct ScriptedRegistrar {
    script: Arc<Script>,
}

impl ScriptedRegistrar {
    /// A registrar without a backend waiting on its script.
    pub fn detached() -> Self {
        ScriptedRegistrar {
            script: Arc::default(),
        }
    }

    fn open(&self) -> io::Result<MutexGuard<'_, ScriptState>> {
        let state = self.script.state();
        if state.queue_closed {
            return Err(io::Error::new(io::ErrorKind::Other, "queue is closed"));
        }
        Ok(state)
    }
}

thread_local! {
    static LAST_SCRIPT: RefCell<Option<Arc<Script>>> = const { RefCell::new(None) };
}

impl Backend for ScriptedBackend {
    type Handle = u32;
    type Registrar = ScriptedRegistrar;

    fn open_queue(_config: &Config) -> io::Result<(Self, Self::Registrar)> {
        let script = Arc::new(Script::default());
        LAST_SCRIPT.with(|last| *last.borrow_mut() = Some(Arc::clone(&script)));
        Ok((
            ScriptedBackend {
                script: Arc::clone(&script),
            },
            ScriptedRegistrar { script },
        ))
    }

    fn wait(&mut self, batch: &mut Batch<u32>) -> io::Result<Wakeup> {
        let guard = self.script.state();
        let mut state = self
            .script
            .changed
            .wait_while(guard, |s| s.steps.is_empty() && !s.shutdown)
            .unwrap_or_else(PoisonError::into_inner);

        while let Some(step) = state.steps.pop_front() {
            match step {
                Step::Event(event) => batch.push(event),
                Step::Error(error) => batch.push_error(error),
                Step::Fail(kind) if batch.is_empty() => return Err(io::Error::from(kind)),
                Step::Fail(kind) => {
                    state.steps.push_front(Step::Fail(kind));
                    break;
                }
            }
        }

        if state.shutdown {
            state.shutdown = false;
            Ok(Wakeup::Shutdown)
        } else {
            Ok(Wakeup::Ready)
        }
    }

    fn close_queue(self) -> io::Result<()> {
        self.script.update(|s| s.queue_closed = true);
        Ok(())
    }
}

impl Registrar for ScriptedRegistrar {
    type Handle = u32;

    fn open_handle(&self, path: &Path) -> io::Result<u32> {
        fs::symlink_metadata(path)?;
        let mut state = self.open()?;
        let handle = state.next_handle;
        state.next_handle += 1;
        state.opened += 1;
        state.handles.insert(handle, path.to_path_buf());
        Ok(handle)
    }

    fn register(&self, handle: u32, condition: Condition) -> io::Result<()> {
        let mut state = self.open()?;
        if !state.handles.contains_key(&handle) {
            return Err(io::Error::from(io::ErrorKind::InvalidInput));
        }
        state.registered.insert(handle, condition);
        Ok(())
    }

    fn deregister(&self, handle: u32) -> io::Result<()> {
        let mut state = self.open()?;
        if state.fail_deregister {
            return Err(io::Error::new(io::ErrorKind::Other, "scripted failure"));
        }
        state.registered.remove(&handle);
        Ok(())
    }

    fn close_handle(&self, handle: u32) -> io::Result<()> {
        let mut state = self.open()?;
        state.registered.remove(&handle);
        state
            .handles
            .remove(&handle)
            .map(drop)
            .ok_or_else(|| io::Error::from(io::ErrorKind::InvalidInput))
    }

    fn trigger_shutdown(&self) -> io::Result<()> {
        // the signal goes away with the queue
        self.open()?.shutdown = true;
        self.script.changed.notify_all();
        Ok(())
    }
}

/// Creates a [`Watcher`] on a [`ScriptedBackend`] and returns the script driving it.
pub fn scripted_watcher() -> (Watcher<ScriptedBackend>, Arc<Script>) {
    scripted_watcher_with_config(Config::default())
}

pub fn scripted_watcher_with_config(config: Config) -> (Watcher<ScriptedBackend>, Arc<Script>) {
    let watcher =
        Watcher::<ScriptedBackend>::with_backend(config).expect("Unable to create a watcher");
    let script = LAST_SCRIPT
        .with(|last| last.borrow_mut().take())
        .expect("the scripted backend was not opened");
    (watcher, script)
}

mod expect {
    use std::{
        collections::VecDeque,
        fmt::Debug,
        path::{Path, PathBuf},
    };

    use notify_vnode_types::event::{Event, Op};

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub enum UnexpectedEventBehaviour {
        Ignore,
        Panic,
    }

    /// Helper to check events and them sort order
    #[derive(Debug)]
    pub struct ExpectedState<C> {
        pub remain: C,
        pub received: Vec<Event>,
        pub unexpected_event_behaviour: UnexpectedEventBehaviour,
    }

    impl ExpectedState<Ordered> {
        pub fn ordered(iter: impl IntoIterator<Item = ExpectedEvent>) -> Self {
            Self::new(iter)
        }
    }

    impl ExpectedState<Unordered> {
        pub fn unordered(iter: impl IntoIterator<Item = ExpectedEvent>) -> Self {
            Self::new(iter)
        }
    }

    impl<C: ExpectedEvents> ExpectedState<C> {
        pub fn new(iter: impl IntoIterator<Item = ExpectedEvent>) -> Self {
            Self {
                remain: iter.into_iter().collect(),
                received: Default::default(),
                unexpected_event_behaviour: UnexpectedEventBehaviour::Ignore,
            }
        }

        pub fn allow_unexpected(mut self) -> Self {
            self.unexpected_event_behaviour = UnexpectedEventBehaviour::Ignore;
            self
        }

        pub fn disallow_unexpected(mut self) -> Self {
            self.unexpected_event_behaviour = UnexpectedEventBehaviour::Panic;
            self
        }

        pub fn is_empty(&self) -> bool {
            self.remain.is_empty()
        }

        pub fn check(&mut self, event: Event) {
            let expected = self.remain.expected(&event);
            self.received.push(event);

            if expected.is_none()
                && self.unexpected_event_behaviour == UnexpectedEventBehaviour::Panic
            {
                panic!("Unexpected event. State: {:#?}", self)
            }
        }

        pub fn into_received(self) -> Vec<Event> {
            self.received
        }
    }

    pub trait ExpectedEvents: Debug + FromIterator<ExpectedEvent> {
        fn is_empty(&self) -> bool;

        /// Returns
        /// * None if the event is unexpected
        /// * Some(expected) if the event was matched with the expected one
        fn expected(&mut self, event: &Event) -> Option<ExpectedEvent>;
    }

    /// Collection of [`ExpectedEvent`]s that allows events to be received in any order
    #[derive(Debug)]
    pub struct Unordered(Vec<ExpectedEvent>);

    impl ExpectedEvents for Unordered {
        fn is_empty(&self) -> bool {
            self.0.is_empty()
        }

        fn expected(&mut self, event: &Event) -> Option<ExpectedEvent> {
            let found_idx = self.0.iter().position(|expected| expected == event)?;
            Some(self.0.swap_remove(found_idx))
        }
    }

    /// Collection of [`ExpectedEvent`]s that allows events to be received in the specified order
    #[derive(Debug)]
    pub struct Ordered(VecDeque<ExpectedEvent>);

    impl ExpectedEvents for Ordered {
        fn is_empty(&self) -> bool {
            self.0.is_empty()
        }

        fn expected(&mut self, event: &Event) -> Option<ExpectedEvent> {
            loop {
                match self.0.front() {
                    Some(expected) => {
                        if expected == event {
                            break self.0.pop_front();
                        } else if expected.is_optional() {
                            self.0.pop_front();
                        } else {
                            break None;
                        }
                    }
                    None => break None,
                }
            }
        }
    }

    impl FromIterator<ExpectedEvent> for Unordered {
        fn from_iter<T: IntoIterator<Item = ExpectedEvent>>(iter: T) -> Self {
            Self(iter.into_iter().collect())
        }
    }

    impl FromIterator<ExpectedEvent> for Ordered {
        fn from_iter<T: IntoIterator<Item = ExpectedEvent>>(iter: T) -> Self {
            Self(iter.into_iter().collect())
        }
    }

    /// Creates an [`ExpectedEvent`] for the provided path
    pub fn expected(path: impl AsRef<Path>) -> ExpectedEvent {
        ExpectedEvent {
            path: Some(path.as_ref().to_path_buf()),
            op: None,
            optional: false,
        }
    }

    /// Predicate to accept or refuse an event
    ///
    /// It implements `PartialEq<Event>`
    #[derive(Debug, Default, Clone)]
    pub struct ExpectedEvent {
        path: Option<PathBuf>,
        op: Option<Op>,
        optional: bool,
    }

    impl PartialEq<Event> for ExpectedEvent {
        fn eq(&self, other: &Event) -> bool {
            self.op.map_or(true, |op| op == other.op)
                && self.path.as_ref().map_or(true, |path| path == &other.path)
        }
    }

    impl PartialEq<ExpectedEvent> for Event {
        fn eq(&self, other: &ExpectedEvent) -> bool {
            other.eq(self)
        }
    }

    macro_rules! op {
        ($name: ident, $op: expr) => {
            pub fn $name(self) -> Self {
                self.op($op)
            }
        };
    }

    impl ExpectedEvent {
        /// There may be no event.
        ///
        /// It **does not** affect PartialEq, it is external information
        pub fn optional(mut self) -> Self {
            self.optional = true;
            self
        }

        pub fn is_optional(&self) -> bool {
            self.optional
        }

        op!(create, Op::CREATE);
        op!(write, Op::WRITE);
        op!(remove, Op::REMOVE);
        op!(rename, Op::RENAME);
        op!(chmod, Op::CHMOD);

        /// Expects exactly `op`, for events carrying several operations
        pub fn op(mut self, op: Op) -> Self {
            self.op = Some(op);
            self
        }
    }
}
