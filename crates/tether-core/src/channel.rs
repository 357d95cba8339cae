//! Single-producer/single-consumer async queue with a terminal return value.
//!
//! A producer calls [`Sender::send`] any number of times and then
//! [`Sender::finish`] exactly once. The consumer drains queued values in FIFO
//! order, then receives the return value once, then end-of-stream forever.

use crate::utils::lock;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use tether_proto::{Error, Result};
use tokio::sync::Notify;

/// One item pulled from a [`Receiver`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Next<T, R> {
    /// A value passed to `send`.
    Value(T),
    /// The value passed to `finish`. Yielded exactly once.
    Return(R),
    /// The stream is exhausted.
    End,
}

struct State<T, R> {
    queue: VecDeque<T>,
    ret: Option<R>,
    finished: bool,
}

struct Shared<T, R> {
    state: Mutex<State<T, R>>,
    ready: Notify,
}

/// Producing half of a channel.
///
/// Clones share the same queue; the single-producer contract is about
/// ordering, not about the number of handles.
pub struct Sender<T, R> {
    shared: Arc<Shared<T, R>>,
}

impl<T, R> Clone for Sender<T, R> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

/// Consuming half of a channel.
pub struct Receiver<T, R> {
    shared: Arc<Shared<T, R>>,
}

/// Creates a new channel.
pub fn channel<T, R>() -> (Sender<T, R>, Receiver<T, R>) {
    let shared = Arc::new(Shared {
        state: Mutex::new(State {
            queue: VecDeque::new(),
            ret: None,
            finished: false,
        }),
        ready: Notify::new(),
    });
    (
        Sender {
            shared: Arc::clone(&shared),
        },
        Receiver { shared },
    )
}

impl<T, R> Sender<T, R> {
    /// Queues a value for the consumer.
    pub fn send(&self, value: T) -> Result<()> {
        {
            let mut state = lock(&self.shared.state);
            if state.finished {
                return Err(Error::ChannelFinished);
            }
            state.queue.push_back(value);
        }
        self.shared.ready.notify_one();
        Ok(())
    }

    /// Closes the channel with a terminal return value.
    pub fn finish(&self, ret: R) -> Result<()> {
        {
            let mut state = lock(&self.shared.state);
            if state.finished {
                return Err(Error::ChannelFinished);
            }
            state.finished = true;
            state.ret = Some(ret);
        }
        self.shared.ready.notify_one();
        Ok(())
    }

    /// Returns true once `finish` has been called.
    pub fn is_finished(&self) -> bool {
        lock(&self.shared.state).finished
    }
}

impl<T, R> Receiver<T, R> {
    /// Pulls the next item without waiting.
    ///
    /// Returns `None` if the producer has neither sent nor finished yet.
    pub fn try_next(&mut self) -> Option<Next<T, R>> {
        let mut state = lock(&self.shared.state);
        if let Some(value) = state.queue.pop_front() {
            return Some(Next::Value(value));
        }
        if state.finished {
            return Some(match state.ret.take() {
                Some(ret) => Next::Return(ret),
                None => Next::End,
            });
        }
        None
    }

    /// Waits for the next item.
    pub async fn next(&mut self) -> Next<T, R> {
        loop {
            if let Some(next) = self.try_next() {
                return next;
            }
            // A notify_one issued between try_next and here leaves a permit,
            // so this cannot miss a wakeup.
            self.shared.ready.notified().await;
        }
    }
}
