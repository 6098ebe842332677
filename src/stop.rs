//! Cooperative cancellation signals.
//!
//! Every asynchronous boundary in this crate carries an explicit
//! [`StopToken`] instead of relying on ambient wiring. A token is derived
//! from one or more [`StopSource`]s and trips when any of them stops.
//! Signals only propagate downward: stopping a source cancels everything
//! holding one of its tokens, while a token can never reach back up and
//! stop its source.

use std::pin::Pin;
use std::task::{Context, Poll};

use async_channel::{bounded, Receiver, Sender};
use futures_lite::future::poll_fn;
use futures_lite::pin;
use std::future::Future;

/// The owning side of a cancellation signal.
///
/// Calling [`stop`][StopSource::stop] or dropping the source trips every
/// [`StopToken`] derived from it. Stopping is idempotent.
#[derive(Debug)]
pub struct StopSource {
    sender: Sender<()>,
    receiver: Receiver<()>,
}

impl StopSource {
    /// Create a new, untripped source.
    pub fn new() -> Self {
        // Nothing is ever sent on the channel. Closing it is the signal,
        // which is what makes dropping the source equivalent to `stop()`.
        let (sender, receiver) = bounded(1);
        Self { sender, receiver }
    }

    /// Derive a token observing this source.
    pub fn token(&self) -> StopToken {
        StopToken {
            signals: vec![self.receiver.clone()],
        }
    }

    /// Trip the signal.
    pub fn stop(&self) {
        self.sender.close();
    }

    /// Whether the signal has already been tripped.
    pub fn is_stopped(&self) -> bool {
        self.sender.is_closed()
    }
}

impl Default for StopSource {
    fn default() -> Self {
        Self::new()
    }
}

/// A cheaply cloneable view of one or more [`StopSource`]s.
#[derive(Debug, Clone)]
pub struct StopToken {
    signals: Vec<Receiver<()>>,
}

impl StopToken {
    /// A token that never trips. Useful as a default when a caller has no
    /// lifetime to tie a subscription to.
    pub fn never() -> Self {
        Self { signals: vec![] }
    }

    /// Combine two tokens into one that trips when either does.
    ///
    /// This is how a request signal observes both server shutdown and
    /// connection close without either side learning about the other.
    pub fn merged(a: &StopToken, b: &StopToken) -> Self {
        let mut signals = a.signals.clone();
        signals.extend(b.signals.iter().cloned());
        Self { signals }
    }

    /// Whether any observed source has stopped.
    pub fn is_stopped(&self) -> bool {
        self.signals.iter().any(|rx| rx.is_closed())
    }

    /// Resolves once any observed source stops. A token with no sources
    /// stays pending forever.
    pub async fn stopped(&self) {
        poll_fn(|cx| self.poll_stopped(cx)).await
    }

    pub(crate) fn poll_stopped(&self, cx: &mut Context<'_>) -> Poll<()> {
        for rx in &self.signals {
            let recv = rx.recv();
            pin!(recv);
            // The channel only ever closes, so `Ok` cannot happen.
            if let Poll::Ready(Err(_)) = Pin::new(&mut recv).poll(cx) {
                return Poll::Ready(());
            }
        }
        Poll::Pending
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_lite::future::block_on;

    #[test]
    fn stop_trips_tokens() {
        let source = StopSource::new();
        let token = source.token();
        assert!(!token.is_stopped());
        source.stop();
        assert!(token.is_stopped());
        block_on(token.stopped());
    }

    #[test]
    fn stop_is_idempotent() {
        let source = StopSource::new();
        source.stop();
        source.stop();
        assert!(source.is_stopped());
    }

    #[test]
    fn drop_counts_as_stop() {
        let source = StopSource::new();
        let token = source.token();
        drop(source);
        assert!(token.is_stopped());
    }

    #[test]
    fn merged_token_observes_both_sources() {
        let server = StopSource::new();
        let connection = StopSource::new();
        let token = StopToken::merged(&server.token(), &connection.token());
        assert!(!token.is_stopped());
        connection.stop();
        assert!(token.is_stopped());
        // Stopping a child signal must not reach the sibling source.
        assert!(!server.is_stopped());
    }

    #[test]
    fn never_token_stays_pending() {
        let token = StopToken::never();
        assert!(!token.is_stopped());
    }
}
