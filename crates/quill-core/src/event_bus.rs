use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::mpsc::{self, error::TryRecvError, UnboundedReceiver, UnboundedSender};

use quill_types::{Event, EventType};

/// One subscriber's unbounded FIFO. Yields `None` once closed and drained.
pub struct Channel<T> {
    rx: UnboundedReceiver<Event<T>>,
}

impl<T> Channel<T> {
    /// Waits for the next event.
    pub async fn pop(&mut self) -> Option<Event<T>> {
        self.rx.recv().await
    }

    pub fn try_pop(&mut self) -> Option<Event<T>> {
        match self.rx.try_recv() {
            Ok(event) => Some(event),
            Err(TryRecvError::Empty | TryRecvError::Disconnected) => None,
        }
    }

    /// For plain threads outside the runtime. Panics if called from async context.
    pub fn blocking_pop(&mut self) -> Option<Event<T>> {
        self.rx.blocking_recv()
    }

    /// Stops delivery to this channel; already queued events can still be popped.
    pub fn close(&mut self) {
        self.rx.close();
    }

    pub fn is_closed(&self) -> bool {
        self.rx.is_closed()
    }
}

struct BrokerState<T> {
    shutdown: bool,
    next_id: u64,
    subscribers: HashMap<u64, UnboundedSender<Event<T>>>,
}

/// Publish/subscribe fan-out. Every subscriber sees every event published
/// after it subscribed, in publish order.
pub struct EventBroker<T> {
    state: Arc<Mutex<BrokerState<T>>>,
}

impl<T> Clone for EventBroker<T> {
    fn clone(&self) -> Self {
        Self {
            state: self.state.clone(),
        }
    }
}

impl<T> Default for EventBroker<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> EventBroker<T> {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(BrokerState {
                shutdown: false,
                next_id: 0,
                subscribers: HashMap::new(),
            })),
        }
    }

    fn lock(&self) -> MutexGuard<'_, BrokerState<T>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn subscribe(&self) -> Channel<T> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut state = self.lock();
        if state.shutdown {
            drop(tx);
            return Channel { rx };
        }
        let id = state.next_id;
        state.next_id += 1;
        state.subscribers.insert(id, tx);
        Channel { rx }
    }

    pub fn subscriber_count(&self) -> usize {
        self.lock().subscribers.len()
    }

    /// Closes every channel and turns later subscriptions into closed channels.
    pub fn shutdown(&self) {
        let mut state = self.lock();
        state.shutdown = true;
        state.subscribers.clear();
    }

    pub fn is_shutdown(&self) -> bool {
        self.lock().shutdown
    }
}

impl<T: Clone> EventBroker<T> {
    /// Returns how many channels accepted the event.
    pub fn publish(&self, event_type: EventType, payload: T) -> usize {
        let snapshot: Vec<(u64, UnboundedSender<Event<T>>)> = {
            let state = self.lock();
            if state.shutdown {
                return 0;
            }
            state
                .subscribers
                .iter()
                .map(|(id, tx)| (*id, tx.clone()))
                .collect()
        };

        let event = Event::new(event_type, payload);
        let mut delivered = 0;
        let mut gone = Vec::new();
        for (id, tx) in snapshot {
            if tx.send(event.clone()).is_ok() {
                delivered += 1;
            } else {
                gone.push(id);
            }
        }

        if !gone.is_empty() {
            let mut state = self.lock();
            for id in gone {
                state.subscribers.remove(&id);
            }
        }
        delivered
    }
}
