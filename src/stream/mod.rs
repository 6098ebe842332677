//! Push streams with teardown registration.
//!
//! A [`Stream`] is a contract, not a container: subscribing re-invokes the
//! producer, which pushes values through an [`Emitter`] until it errors or
//! completes. Everything in this crate that produces bytes or events over
//! time — request bodies, SSE feeds, broadcast deliveries — flows through
//! this primitive so that cancellation and cleanup behave the same way
//! everywhere.
//!
//! Terminal events are sticky: after `error` or `complete`, later `next`
//! calls are discarded and never reach the subscriber. Teardown callbacks
//! run exactly once, in last-registered-first order, whether the
//! subscription ends by terminal event, cancellation or drop.

use std::fmt;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};

use async_channel::{Receiver, Sender, TrySendError};
use http_types::{Error, Result};

use crate::stop::StopToken;

mod merge;

pub use merge::merge;

/// A cleanup callback guaranteed to run once.
pub struct Teardown(Option<Box<dyn FnOnce() + Send + Sync>>);

impl Teardown {
    /// Wrap a callback.
    pub fn new(f: impl FnOnce() + Send + Sync + 'static) -> Self {
        Self(Some(Box::new(f)))
    }

    fn run(mut self) {
        if let Some(f) = self.0.take() {
            f();
        }
    }
}

impl fmt::Debug for Teardown {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Teardown").finish()
    }
}

enum Event<T> {
    Next(T),
    Error(Error),
    Complete,
}

/// The push side handed to a producer on every subscription.
///
/// Cloneable so producers can move it into a spawned task.
pub struct Emitter<T> {
    sender: Sender<Event<T>>,
    active: Arc<AtomicBool>,
}

impl<T> Clone for Emitter<T> {
    fn clone(&self) -> Self {
        Self {
            sender: self.sender.clone(),
            active: self.active.clone(),
        }
    }
}

impl<T> fmt::Debug for Emitter<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Emitter")
            .field("active", &self.is_active())
            .finish()
    }
}

impl<T> Emitter<T> {
    /// Push a value. Returns `false` once the subscription is terminated,
    /// cancelled or dropped — producers should treat that as a stop
    /// signal and release whatever they hold.
    pub fn next(&self, value: T) -> bool {
        if !self.active.load(Ordering::Acquire) {
            return false;
        }
        match self.sender.try_send(Event::Next(value)) {
            Ok(()) => true,
            // The queue is unbounded; the only failure is disconnection.
            Err(TrySendError::Closed(_)) | Err(TrySendError::Full(_)) => false,
        }
    }

    /// Terminate the subscription with an error. No-op after a terminal
    /// event has already fired.
    pub fn error(&self, err: Error) {
        if self.active.swap(false, Ordering::AcqRel) {
            let _ = self.sender.try_send(Event::Error(err));
            self.sender.close();
        }
    }

    /// Terminate the subscription normally. No-op after a terminal event
    /// has already fired.
    pub fn complete(&self) {
        if self.active.swap(false, Ordering::AcqRel) {
            let _ = self.sender.try_send(Event::Complete);
            self.sender.close();
        }
    }

    /// Whether values pushed now can still be delivered.
    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire) && !self.sender.is_closed()
    }
}

/// A cold, single-subscriber push stream.
pub struct Stream<T> {
    producer: Arc<dyn Fn(Emitter<T>) -> Option<Teardown> + Send + Sync>,
}

impl<T> Clone for Stream<T> {
    fn clone(&self) -> Self {
        Self {
            producer: self.producer.clone(),
        }
    }
}

impl<T> fmt::Debug for Stream<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Stream").finish()
    }
}

impl<T: Send + 'static> Stream<T> {
    /// Create a stream from a producer. The producer runs once per
    /// subscription and may return a teardown for the resources it
    /// acquired; long-running producers usually move the emitter into a
    /// spawned task and return a teardown that cancels it.
    pub fn new(producer: impl Fn(Emitter<T>) -> Option<Teardown> + Send + Sync + 'static) -> Self {
        Self {
            producer: Arc::new(producer),
        }
    }

    /// A stream of exactly one value.
    pub fn of(value: T) -> Self
    where
        T: Clone + Sync,
    {
        Self::new(move |emitter| {
            emitter.next(value.clone());
            emitter.complete();
            None
        })
    }

    /// A stream that completes immediately.
    pub fn empty() -> Self {
        Self::new(|emitter| {
            emitter.complete();
            None
        })
    }

    /// A stream that errors immediately with `message`.
    pub fn failed(message: impl Into<String>) -> Self {
        let message = message.into();
        Self::new(move |emitter| {
            emitter.error(http_types::format_err!("{}", message));
            None
        })
    }

    /// Run the producer and return the consuming half. The subscription
    /// observes `token`: cancellation tears the producer down and ends
    /// delivery without a terminal event.
    pub fn subscribe(&self, token: StopToken) -> Subscription<T> {
        let (sender, receiver) = async_channel::unbounded();
        let emitter = Emitter {
            sender,
            active: Arc::new(AtomicBool::new(true)),
        };
        let mut subscription = Subscription {
            receiver,
            token,
            teardowns: Vec::new(),
            done: false,
        };
        // Registered first so the producer's own teardown runs last.
        if let Some(teardown) = (self.producer)(emitter) {
            subscription.teardowns.push(teardown);
        }
        subscription
    }
}

/// The pull side of one [`Stream::subscribe`] call.
///
/// Yields `Ok(value)` items, then either an `Err` item (producer error)
/// or a plain end of stream (completion or cancellation).
pub struct Subscription<T> {
    receiver: Receiver<Event<T>>,
    token: StopToken,
    teardowns: Vec<Teardown>,
    done: bool,
}

impl<T> fmt::Debug for Subscription<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("done", &self.done)
            .field("teardowns", &self.teardowns.len())
            .finish()
    }
}

impl<T> Subscription<T> {
    /// Register a cleanup callback. Teardowns run exactly once, in
    /// reverse registration order.
    pub fn add_teardown(&mut self, f: impl FnOnce() + Send + Sync + 'static) {
        if self.done {
            // Late registration after the subscription finished: the
            // guarantee is "runs once", so run it now.
            Teardown::new(f).run();
        } else {
            self.teardowns.push(Teardown::new(f));
        }
    }

    /// The token this subscription was created with.
    pub fn token(&self) -> &StopToken {
        &self.token
    }

    /// End the subscription now, running teardowns and detaching the
    /// producer.
    pub fn unsubscribe(mut self) {
        self.finish();
    }

    fn finish(&mut self) {
        if self.done {
            return;
        }
        self.done = true;
        self.receiver.close();
        while let Some(teardown) = self.teardowns.pop() {
            teardown.run();
        }
    }
}

impl<T> futures_lite::Stream for Subscription<T> {
    type Item = Result<T>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        if this.done {
            return Poll::Ready(None);
        }
        // Cancellation wins over queued values.
        if this.token.poll_stopped(cx).is_ready() {
            this.finish();
            return Poll::Ready(None);
        }
        let recv = this.receiver.recv();
        futures_lite::pin!(recv);
        match std::future::Future::poll(recv, cx) {
            Poll::Ready(Ok(Event::Next(value))) => Poll::Ready(Some(Ok(value))),
            Poll::Ready(Ok(Event::Error(err))) => {
                this.finish();
                Poll::Ready(Some(Err(err)))
            }
            Poll::Ready(Ok(Event::Complete)) | Poll::Ready(Err(_)) => {
                this.finish();
                Poll::Ready(None)
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

impl<T> Drop for Subscription<T> {
    fn drop(&mut self) {
        self.finish();
    }
}
