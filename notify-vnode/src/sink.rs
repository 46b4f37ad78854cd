//! Delivery of events and errors to the consumer.

use crossbeam_channel::{select, Receiver, Sender, TrySendError};
use notify_vnode_types::event::Event;

use crate::Error;

/// Sending half of the two sinks, owned by the dispatch loop.
///
/// A hand-off blocks until a consumer takes the value or the watcher is closed, whichever comes
/// first. Dropping the emitter disconnects both sinks.
#[derive(Debug)]
pub(crate) struct Emitter {
    events: Sender<Event>,
    errors: Sender<Error>,
    done: Receiver<()>,
}

/// Receiving halves of the sinks and the closing side of the done signal.
pub(crate) struct Sinks {
    pub(crate) events: Receiver<Event>,
    pub(crate) errors: Receiver<Error>,
    pub(crate) done: Sender<()>,
}

impl Emitter {
    /// Creates the emitter and the consumer side. A capacity of 0 makes a rendezvous channel.
    pub(crate) fn new(event_capacity: usize, error_capacity: usize) -> (Emitter, Sinks) {
        let (event_tx, event_rx) = crossbeam_channel::bounded(event_capacity);
        let (error_tx, error_rx) = crossbeam_channel::bounded(error_capacity);
        let (done_tx, done_rx) = crossbeam_channel::bounded(0);
        (
            Emitter {
                events: event_tx,
                errors: error_tx,
                done: done_rx,
            },
            Sinks {
                events: event_rx,
                errors: error_rx,
                done: done_tx,
            },
        )
    }

    /// Hands `event` to the consumer. Returns `false` if it was dropped because the watcher is
    /// shutting down.
    pub(crate) fn event(&self, event: Event) -> bool {
        log::trace!("emitting {event}");
        deliver(&self.events, &self.done, event)
    }

    /// Hands `error` to the consumer, see [`Emitter::event`].
    pub(crate) fn error(&self, error: Error) -> bool {
        log::trace!("emitting error: {error}");
        deliver(&self.errors, &self.done, error)
    }
}

fn deliver<T>(sink: &Sender<T>, done: &Receiver<()>, value: T) -> bool {
    match sink.try_send(value) {
        Ok(()) => true,
        Err(TrySendError::Disconnected(_)) => false,
        Err(TrySendError::Full(value)) => {
            // nothing is ever sent on `done`, it only disconnects
            select! {
                send(sink, value) -> res => res.is_ok(),
                recv(done) -> _ => false,
            }
        }
    }
}
