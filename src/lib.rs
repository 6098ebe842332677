//! An embeddable async HTTP server runtime.
//!
//! One request/response model is served over several transports: plain
//! HTTP/1.1 with keep-alive, HTTP/2 compatibility sinks with server
//! push, websocket takeover of the raw duplex, and long-lived response
//! streams for server-sent events.
//!
//! ```txt
//!              decode                   dispatch
//!                   \                  /
//!   transport  ->    -> Request  ->  Services (hooks)
//!                                        |
//!   transport  <-    <- Reply    <-      |
//!                   /
//!              encode
//! ```
//!
//! Behavior is contributed through [`Service`] hooks; the first service
//! to return a [`Reply`] wins. Response bodies are [`Stream`]s of byte
//! chunks, written as the producer emits them, so a slow consumer or a
//! cancelled request never buffers unbounded data.
//!
//! # Example
//!
//! ```no_run
//! use async_serve::{MethodService, Reply, Server, ServerConfig, Services};
//! use http_types::{Method, StatusCode};
//!
//! fn main() -> http_types::Result<()> {
//!     async_global_executor::block_on(async {
//!         let hello = MethodService::new("hello").on(Method::Get, |_req, _push| {
//!             Box::pin(async {
//!                 let mut reply = Reply::new();
//!                 reply.set_status(StatusCode::Ok);
//!                 reply.set_body_string("hello world\n");
//!                 Ok(Some(reply))
//!             })
//!         });
//!
//!         let server = Server::new(ServerConfig::default(), Services::new().with(hello));
//!         server.serve().await
//!     })
//! }
//! ```

#![forbid(unsafe_code)]
#![deny(future_incompatible, rust_2018_idioms)]
#![deny(missing_debug_implementations, nonstandard_style)]
#![warn(missing_docs, unreachable_pub)]
#![cfg_attr(test, deny(warnings))]

/// The maximum amount of headers parsed per request.
const MAX_HEADERS: usize = 128;

/// The maximum length of a request head, in bytes.
const MAX_HEAD_LENGTH: usize = 8 * 1024;

pub use body::{BodyReader, Chunk, ChunkStream, GuardedBody};
pub use broadcast::{Admission, Broadcast, BroadcastConfig, CapacityPolicy, Welcome};
pub use h2::{CompatResponse, PushCapability, PushSession};
pub use reply::{Reply, ReplyBody};
pub use request::{Request, RequestPatch};
pub use server::{Lifecycle, Server, ServerConfig, ServerInfo, SignalConfig, StopReason};
pub use service::{HookFuture, MethodService, Service, Services};
pub use sse::ServerEvent;
pub use stop::{StopSource, StopToken};
pub use stream::{merge, Emitter, Stream, Subscription, Teardown};
pub use upgrade::{RawIo, RawStream, UpgradeHandler, WebsocketGate};

mod body;
mod broadcast;
mod chunked;
mod date;
mod h2;
mod reply;
mod request;
mod server;
mod service;
mod sse;
mod stop;
mod stream;
mod upgrade;
