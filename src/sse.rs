//! The `text/event-stream` wire format.

use std::time::Duration;

use futures_lite::StreamExt;

use crate::body::ChunkStream;
use crate::reply::Reply;
use crate::stop::StopToken;
use crate::stream::{Stream, Teardown};

/// One event on a server-sent event feed.
///
/// The `"message"` type is the wire default and is omitted when
/// serialized.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerEvent {
    id: Option<u64>,
    event: Option<String>,
    data: String,
    retry: Option<Duration>,
}

impl ServerEvent {
    /// A `message` event carrying `data`.
    pub fn new(data: impl Into<String>) -> Self {
        Self {
            id: None,
            event: None,
            data: data.into(),
            retry: None,
        }
    }

    /// An event with an explicit type.
    pub fn with_event(event: impl Into<String>, data: impl Into<String>) -> Self {
        Self {
            id: None,
            event: Some(event.into()),
            data: data.into(),
            retry: None,
        }
    }

    /// The delivery id, when stamped.
    pub fn id(&self) -> Option<u64> {
        self.id
    }

    /// Stamp the delivery id.
    pub fn set_id(&mut self, id: u64) {
        self.id = Some(id);
    }

    /// The event type.
    pub fn event(&self) -> &str {
        self.event.as_deref().unwrap_or("message")
    }

    /// The payload.
    pub fn data(&self) -> &str {
        &self.data
    }

    /// Advertise a reconnection delay to the client.
    pub fn set_retry(&mut self, retry: Duration) {
        self.retry = Some(retry);
    }

    /// Serialize to the wire: optional `id:`, optional `retry:`,
    /// optional `event:` (omitted for `message`), one `data:` per
    /// payload line, then a blank line.
    pub fn to_wire(&self) -> String {
        let mut out = String::new();
        if let Some(id) = self.id {
            out.push_str(&format!("id: {}\n", id));
        }
        if let Some(retry) = self.retry {
            out.push_str(&format!("retry: {}\n", retry.as_millis()));
        }
        if let Some(event) = &self.event {
            if event != "message" {
                out.push_str(&format!("event: {}\n", event));
            }
        }
        for line in self.data.split('\n') {
            out.push_str("data: ");
            out.push_str(line);
            out.push('\n');
        }
        out.push('\n');
        out
    }
}

/// Adapt an event stream into the body chunks of its wire form.
pub(crate) fn event_chunks(events: Stream<ServerEvent>) -> ChunkStream {
    Stream::new(move |emitter| {
        let mut subscription = events.subscribe(StopToken::never());
        let task = async_global_executor::spawn(async move {
            while let Some(item) = subscription.next().await {
                match item {
                    Ok(event) => {
                        if !emitter.next(event.to_wire().into_bytes()) {
                            break;
                        }
                    }
                    Err(err) => {
                        emitter.error(err);
                        return;
                    }
                }
            }
            emitter.complete();
        });
        Some(Teardown::new(move || drop(task)))
    })
}

impl Reply {
    /// An event-stream response: `200`, `content-type:
    /// text/event-stream`, caching disabled, and `events` serialized as
    /// the body.
    pub fn from_event_stream(events: Stream<ServerEvent>) -> Reply {
        let mut reply = Reply::new();
        reply.set_status(http_types::StatusCode::Ok);
        reply.insert_header("content-type", "text/event-stream");
        reply.insert_header("cache-control", "no-store");
        reply.set_body_stream(event_chunks(events), None);
        reply
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reply::ReplyBody;
    use futures_lite::future::block_on;

    #[test]
    fn full_frame_field_order() {
        let mut event = ServerEvent::with_event("update", "hello");
        event.set_id(7);
        event.set_retry(Duration::from_secs(15));
        assert_eq!(event.to_wire(), "id: 7\nretry: 15000\nevent: update\ndata: hello\n\n");
    }

    #[test]
    fn message_type_is_omitted() {
        let mut event = ServerEvent::new("hi");
        event.set_id(1);
        assert_eq!(event.to_wire(), "id: 1\ndata: hi\n\n");

        let explicit = ServerEvent::with_event("message", "hi");
        assert_eq!(explicit.to_wire(), "data: hi\n\n");
    }

    #[test]
    fn multiline_data_gets_one_field_per_line() {
        let event = ServerEvent::new("a\nb");
        assert_eq!(event.to_wire(), "data: a\ndata: b\n\n");
    }

    #[test]
    fn empty_data_still_serializes() {
        let event = ServerEvent::new("");
        assert_eq!(event.to_wire(), "data: \n\n");
    }

    #[test]
    fn event_stream_reply_shape() {
        let reply = Reply::from_event_stream(Stream::of(ServerEvent::new("x")));
        assert_eq!(reply.status(), Some(http_types::StatusCode::Ok));
        assert_eq!(
            reply.header("content-type").unwrap().as_str(),
            "text/event-stream"
        );
        assert_eq!(reply.header("cache-control").unwrap().as_str(), "no-store");

        let stream = match reply.body() {
            ReplyBody::Stream { stream, .. } => stream.clone(),
            _ => panic!("expected a streaming body"),
        };
        block_on(async {
            let mut sub = stream.subscribe(StopToken::never());
            let first = sub.next().await.unwrap().unwrap();
            assert_eq!(first, b"data: x\n\n".to_vec());
            assert!(sub.next().await.is_none());
        });
    }
}
