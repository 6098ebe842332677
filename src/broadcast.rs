//! A broadcast channel with bounded replay history.
//!
//! Events fan out to every connected client and are retained in a
//! FIFO ring so that a reconnecting client can replay what it missed.
//! The upstream source is demand driven: it is subscribed when the
//! first client joins and released when the last one leaves.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_io::Timer;
use futures_lite::StreamExt;
use http_types::{format_err, StatusCode};

use crate::reply::Reply;
use crate::sse::ServerEvent;
use crate::stop::StopSource;
use crate::stream::{Stream, Teardown};

/// Tuning for a [`Broadcast`] channel.
#[derive(Debug, Clone)]
pub struct BroadcastConfig {
    /// How many events the replay ring retains.
    pub history: usize,
    /// Client cap; `None` is unlimited.
    pub max_clients: Option<usize>,
    /// What to do with a join beyond the cap.
    pub policy: CapacityPolicy,
    /// Keepalive interval; `None` disables keepalives.
    pub keepalive: Option<Duration>,
    /// Event delivered to (or about) joining clients.
    pub welcome: Option<Welcome>,
}

impl Default for BroadcastConfig {
    fn default() -> Self {
        Self {
            history: 64,
            max_clients: None,
            policy: CapacityPolicy::Refuse,
            keepalive: Some(Duration::from_secs(30)),
            welcome: None,
        }
    }
}

/// Admission policy for a full channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CapacityPolicy {
    /// Refuse the joining client.
    Refuse,
    /// Disconnect the longest-connected client to make room.
    KickOldest,
}

/// Greeting behavior on join.
#[derive(Debug, Clone)]
pub enum Welcome {
    /// Sent only to the joining client; never retained.
    Private(ServerEvent),
    /// Broadcast to every client and retained, tagged so replay skips
    /// it for clients that were not there.
    Public(ServerEvent),
}

/// The outcome of [`Broadcast::add_client`].
#[derive(Debug)]
pub enum Admission {
    /// The per-client event feed.
    Joined(Stream<ServerEvent>),
    /// The channel is full under [`CapacityPolicy::Refuse`].
    Refused,
}

struct HistoryEntry {
    id: u64,
    event: ServerEvent,
    welcome: bool,
}

struct Client {
    key: u64,
    outbox: async_channel::Sender<ServerEvent>,
}

struct Feed {
    _forward: async_global_executor::Task<()>,
    _keepalive: Option<async_global_executor::Task<()>>,
    _stop: StopSource,
}

struct State {
    clients: Vec<Client>,
    history: VecDeque<HistoryEntry>,
    next_id: u64,
    next_key: u64,
    feed: Option<Feed>,
}

struct Inner {
    config: BroadcastConfig,
    source: Stream<ServerEvent>,
    state: Mutex<State>,
}

/// A fan-out event channel. Cheap to clone; clones share the channel.
#[derive(Clone)]
pub struct Broadcast {
    inner: Arc<Inner>,
}

impl Broadcast {
    /// A channel fed by `source` whenever at least one client is
    /// connected.
    pub fn new(config: BroadcastConfig, source: Stream<ServerEvent>) -> Self {
        Self {
            inner: Arc::new(Inner {
                config,
                source,
                state: Mutex::new(State {
                    clients: Vec::new(),
                    history: VecDeque::new(),
                    next_id: 1,
                    next_key: 1,
                    feed: None,
                }),
            }),
        }
    }

    /// Publish `event` to every client and retain it for replay.
    /// Returns the stamped delivery id.
    pub fn send(&self, event: ServerEvent) -> u64 {
        self.inner.deliver(event)
    }

    /// The retained events newer than `id`, oldest first. Welcome
    /// events are skipped; ids at or after the newest yield nothing.
    pub fn since(&self, id: u64) -> Vec<ServerEvent> {
        let state = self.inner.lock();
        state
            .history
            .iter()
            .filter(|entry| entry.id > id && !entry.welcome)
            .map(|entry| entry.event.clone())
            .collect()
    }

    /// How many clients are connected.
    pub fn client_count(&self) -> usize {
        self.inner.lock().clients.len()
    }

    /// Join the channel. `last_seen` is the newest id the client has
    /// already observed; missed events are replayed ahead of the live
    /// feed.
    pub fn add_client(&self, last_seen: Option<u64>) -> Admission {
        let mut state = self.inner.lock();

        if let Some(max) = self.inner.config.max_clients {
            if state.clients.len() >= max {
                match self.inner.config.policy {
                    CapacityPolicy::Refuse => {
                        log::debug!("broadcast full ({} clients), refusing join", max);
                        return Admission::Refused;
                    }
                    CapacityPolicy::KickOldest => {
                        let kicked = state.clients.remove(0);
                        kicked.outbox.close();
                        log::debug!("broadcast full, kicked client {}", kicked.key);
                    }
                }
            }
        }

        let key = state.next_key;
        state.next_key += 1;
        let (outbox, feed_rx) = async_channel::unbounded();

        if let Some(last_seen) = last_seen {
            for entry in state.history.iter() {
                if entry.id > last_seen && !entry.welcome {
                    let _ = outbox.try_send(entry.event.clone());
                }
            }
        }

        match &self.inner.config.welcome {
            Some(Welcome::Private(event)) => {
                let _ = outbox.try_send(event.clone());
            }
            Some(Welcome::Public(event)) => {
                let event = Inner::stamp(&mut state, event.clone(), true, self.inner.config.history);
                for client in &state.clients {
                    let _ = client.outbox.try_send(event.clone());
                }
                let _ = outbox.try_send(event);
            }
            None => {}
        }

        state.clients.push(Client { key, outbox });
        log::trace!("broadcast client {} joined ({} connected)", key, state.clients.len());
        if state.clients.len() == 1 {
            state.feed = Some(self.inner.start_feed());
        }
        drop(state);

        Admission::Joined(self.client_stream(key, feed_rx))
    }

    /// Join as a server-sent event response: the feed on success, a
    /// `503` when refused.
    pub fn subscribe_reply(&self, last_seen: Option<u64>) -> Reply {
        match self.add_client(last_seen) {
            Admission::Joined(feed) => Reply::from_event_stream(feed),
            Admission::Refused => {
                let mut reply = Reply::new();
                reply.set_status(StatusCode::ServiceUnavailable);
                reply
            }
        }
    }

    fn client_stream(&self, key: u64, feed_rx: async_channel::Receiver<ServerEvent>) -> Stream<ServerEvent> {
        let weak = Arc::downgrade(&self.inner);
        let slot = Arc::new(Mutex::new(Some(feed_rx)));
        Stream::new(move |emitter| {
            let feed_rx = match slot.lock().ok().and_then(|mut slot| slot.take()) {
                Some(feed_rx) => feed_rx,
                None => {
                    emitter.error(format_err!("client feed already consumed"));
                    return None;
                }
            };
            let task = async_global_executor::spawn(async move {
                while let Ok(event) = feed_rx.recv().await {
                    if !emitter.next(event) {
                        break;
                    }
                }
                emitter.complete();
            });
            let weak = weak.clone();
            Some(Teardown::new(move || {
                drop(task);
                if let Some(inner) = weak.upgrade() {
                    inner.remove_client(key);
                }
            }))
        })
    }
}

impl Inner {
    fn lock(&self) -> std::sync::MutexGuard<'_, State> {
        match self.state.lock() {
            Ok(state) => state,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn stamp(state: &mut State, mut event: ServerEvent, welcome: bool, limit: usize) -> ServerEvent {
        let id = state.next_id;
        state.next_id += 1;
        event.set_id(id);
        state.history.push_back(HistoryEntry {
            id,
            event: event.clone(),
            welcome,
        });
        while state.history.len() > limit {
            state.history.pop_front();
        }
        event
    }

    fn deliver(&self, event: ServerEvent) -> u64 {
        let mut state = self.lock();
        let event = Self::stamp(&mut state, event, false, self.config.history);
        let id = event.id().unwrap_or_default();
        for client in &state.clients {
            let _ = client.outbox.try_send(event.clone());
        }
        id
    }

    fn remove_client(self: &Arc<Self>, key: u64) {
        let mut state = self.lock();
        if let Some(pos) = state.clients.iter().position(|client| client.key == key) {
            state.clients.remove(pos);
            log::trace!("broadcast client {} left ({} connected)", key, state.clients.len());
        }
        if state.clients.is_empty() {
            if let Some(feed) = state.feed.take() {
                drop(state);
                drop(feed);
                log::debug!("last broadcast client left, releasing source");
            }
        }
    }

    fn start_feed(self: &Arc<Self>) -> Feed {
        let stop = StopSource::new();
        let token = stop.token();
        let source = self.source.clone();
        let weak = Arc::downgrade(self);
        let forward = async_global_executor::spawn(async move {
            let mut sub = source.subscribe(token);
            while let Some(item) = sub.next().await {
                match item {
                    Ok(event) => {
                        let inner = match weak.upgrade() {
                            Some(inner) => inner,
                            None => return,
                        };
                        inner.deliver(event);
                    }
                    Err(err) => {
                        log::warn!("broadcast source failed: {}", err);
                        return;
                    }
                }
            }
        });

        let keepalive = self.config.keepalive.map(|every| {
            let weak = Arc::downgrade(self);
            async_global_executor::spawn(async move {
                loop {
                    Timer::after(every).await;
                    let inner = match weak.upgrade() {
                        Some(inner) => inner,
                        None => return,
                    };
                    let state = inner.lock();
                    for client in &state.clients {
                        let _ = client
                            .outbox
                            .try_send(ServerEvent::with_event("keepalive", ""));
                    }
                }
            })
        });

        Feed {
            _forward: forward,
            _keepalive: keepalive,
            _stop: stop,
        }
    }
}

impl std::fmt::Debug for Broadcast {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.inner.lock();
        f.debug_struct("Broadcast")
            .field("clients", &state.clients.len())
            .field("history", &state.history.len())
            .field("next_id", &state.next_id)
            .finish()
    }
}
