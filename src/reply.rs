//! Response descriptions produced by handlers.

use std::fmt;

use http_types::headers::{HeaderName, HeaderValues, Iter, ToHeaderValues};
use http_types::{Response, StatusCode};

use crate::body::ChunkStream;

/// The payload half of a [`Reply`].
#[derive(Debug)]
pub enum ReplyBody {
    /// No payload; the writer ends the response right after the head.
    None,
    /// A managed chunk stream.
    Stream {
        /// The chunk source.
        stream: ChunkStream,
        /// Total payload size, when known before writing.
        length: Option<usize>,
    },
    /// The connection leaves HTTP after the head; an upgrade handler
    /// takes over the raw transport.
    Upgrade,
}

/// A response description: status, headers and body, mutable until the
/// writer serializes it.
///
/// A reply without a status is written as `404 Not Found`.
pub struct Reply {
    status: Option<StatusCode>,
    reason: Option<String>,
    // Header storage; http-types only builds Headers inside a message.
    res: Response,
    body: ReplyBody,
}

impl Reply {
    /// Create an empty reply.
    pub fn new() -> Self {
        Self {
            status: None,
            reason: None,
            res: Response::new(StatusCode::Ok),
            body: ReplyBody::None,
        }
    }

    /// The status a handler set, if any.
    pub fn status(&self) -> Option<StatusCode> {
        self.status
    }

    /// Set the response status.
    pub fn set_status(&mut self, status: StatusCode) {
        self.status = Some(status);
    }

    /// The status the writer serializes.
    pub fn status_or_default(&self) -> StatusCode {
        self.status.unwrap_or(StatusCode::NotFound)
    }

    /// The reason-phrase override, if any.
    pub fn reason(&self) -> Option<&str> {
        self.reason.as_deref()
    }

    /// Override the reason phrase written after the status code.
    pub fn set_reason(&mut self, reason: impl Into<String>) {
        self.reason = Some(reason.into());
    }

    /// Get a header.
    pub fn header(&self, name: impl Into<HeaderName>) -> Option<&HeaderValues> {
        self.res.header(name)
    }

    /// Set a header, replacing any previous values.
    pub fn insert_header(&mut self, name: impl Into<HeaderName>, values: impl ToHeaderValues) {
        self.res.insert_header(name, values);
    }

    /// Append a header value, keeping previous ones.
    pub fn append_header(&mut self, name: impl Into<HeaderName>, values: impl ToHeaderValues) {
        self.res.append_header(name, values);
    }

    /// Remove a header.
    pub fn remove_header(&mut self, name: impl Into<HeaderName>) -> Option<HeaderValues> {
        self.res.remove_header(name)
    }

    /// Iterate over all headers.
    pub fn iter(&self) -> Iter<'_> {
        self.res.iter()
    }

    /// The body.
    pub fn body(&self) -> &ReplyBody {
        &self.body
    }

    /// Replace the body.
    pub fn set_body(&mut self, body: ReplyBody) {
        self.body = body;
    }

    /// Stream `stream` as the body, with the total length when known.
    pub fn set_body_stream(&mut self, stream: ChunkStream, length: Option<usize>) {
        self.body = ReplyBody::Stream { stream, length };
    }

    /// Use an in-memory payload as the body.
    pub fn set_body_bytes(&mut self, bytes: impl Into<Vec<u8>>) {
        let bytes = bytes.into();
        let length = bytes.len();
        self.body = ReplyBody::Stream {
            stream: ChunkStream::from_bytes(bytes),
            length: Some(length),
        };
    }

    /// Use an in-memory string as the body.
    pub fn set_body_string(&mut self, s: impl Into<String>) {
        self.set_body_bytes(s.into().into_bytes());
    }

    /// Take the body out, leaving `ReplyBody::None`.
    pub fn take_body(&mut self) -> ReplyBody {
        std::mem::replace(&mut self.body, ReplyBody::None)
    }

    /// The body length, when known before writing.
    pub fn len(&self) -> Option<usize> {
        match &self.body {
            ReplyBody::None | ReplyBody::Upgrade => Some(0),
            ReplyBody::Stream { length, .. } => *length,
        }
    }

    /// Whether the body is known to be empty.
    pub fn is_empty(&self) -> Option<bool> {
        self.len().map(|len| len == 0)
    }

    /// Merge `patch` into this reply and return the result.
    ///
    /// Headers merge per field: list-valued names (`accept*`,
    /// `access-control-allow-*`, `allow`, `vary`, `server-timing`) become
    /// a de-duplicated comma-join of both sides; every other name is
    /// last-wins. Status, reason and body are replaced when the patch
    /// sets them. The list merge is associative and idempotent.
    pub fn compose(mut self, patch: Reply) -> Reply {
        let Reply {
            status,
            reason,
            res,
            body,
        } = patch;
        let incoming: Vec<(HeaderName, HeaderValues)> = res
            .iter()
            .map(|(name, values)| (name.clone(), values.clone()))
            .collect();
        for (name, values) in incoming {
            if is_list_header(&name) {
                let joined = join_list_values(self.res.header(name.clone()), &values);
                self.res.insert_header(name, joined.as_str());
            } else {
                self.res.remove_header(name.clone());
                for value in values.iter() {
                    self.res.append_header(name.clone(), value.clone());
                }
            }
        }
        if let Some(status) = status {
            self.status = Some(status);
        }
        if let Some(reason) = reason {
            self.reason = Some(reason);
        }
        if !matches!(body, ReplyBody::None) {
            self.body = body;
        }
        self
    }
}

impl Default for Reply {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Reply {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Reply")
            .field("status", &self.status)
            .field("reason", &self.reason)
            .field("body", &self.body)
            .finish()
    }
}

/// Whether composed values of `name` merge by comma-join instead of
/// last-wins.
fn is_list_header(name: &HeaderName) -> bool {
    let name = name.as_str();
    name.starts_with("accept")
        || name.starts_with("access-control-allow-")
        || name == "allow"
        || name == "vary"
        || name == "server-timing"
}

fn join_list_values(existing: Option<&HeaderValues>, incoming: &HeaderValues) -> String {
    let mut parts: Vec<String> = Vec::new();
    {
        let mut push_unique = |piece: &str| {
            let piece = piece.trim();
            if !piece.is_empty() && !parts.iter().any(|known| known == piece) {
                parts.push(piece.to_owned());
            }
        };
        if let Some(values) = existing {
            for value in values.iter() {
                for piece in value.as_str().split(',') {
                    push_unique(piece);
                }
            }
        }
        for value in incoming.iter() {
            for piece in value.as_str().split(',') {
                push_unique(piece);
            }
        }
    }
    parts.join(", ")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reply_with(name: &str, value: &str) -> Reply {
        let mut reply = Reply::new();
        reply.insert_header(name, value);
        reply
    }

    #[test]
    fn list_headers_merge_with_dedup() {
        let merged = reply_with("vary", "a").compose(reply_with("vary", "a, b"));
        assert_eq!(merged.header("vary").unwrap().as_str(), "a, b");
    }

    #[test]
    fn list_merge_is_idempotent() {
        let once = reply_with("vary", "x, y").compose(reply_with("vary", "x, y"));
        assert_eq!(once.header("vary").unwrap().as_str(), "x, y");
    }

    #[test]
    fn list_merge_is_associative() {
        let left = reply_with("allow", "GET")
            .compose(reply_with("allow", "POST"))
            .compose(reply_with("allow", "GET, PUT"));
        let right = reply_with("allow", "GET")
            .compose(reply_with("allow", "POST").compose(reply_with("allow", "GET, PUT")));
        assert_eq!(
            left.header("allow").unwrap().as_str(),
            right.header("allow").unwrap().as_str()
        );
        assert_eq!(left.header("allow").unwrap().as_str(), "GET, POST, PUT");
    }

    #[test]
    fn plain_headers_are_last_wins() {
        let merged = reply_with("content-type", "text/plain")
            .compose(reply_with("content-type", "application/json"));
        assert_eq!(
            merged.header("content-type").unwrap().as_str(),
            "application/json"
        );
    }

    #[test]
    fn status_and_body_replace_when_patch_sets_them() {
        let mut base = Reply::new();
        base.set_status(StatusCode::Ok);
        base.set_body_string("one");

        let mut patch = Reply::new();
        patch.set_status(StatusCode::Created);
        let merged = base.compose(patch);
        assert_eq!(merged.status(), Some(StatusCode::Created));
        // The patch carried no body, so the base body survives.
        assert_eq!(merged.len(), Some(3));
    }

    #[test]
    fn missing_status_defaults_to_not_found() {
        assert_eq!(Reply::new().status_or_default(), StatusCode::NotFound);
    }
}
