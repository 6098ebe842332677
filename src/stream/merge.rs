//! Fan-in of several streams into one.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use futures_lite::StreamExt;

use super::{Stream, Teardown};
use crate::stop::StopToken;

/// Merge `sources` into a single stream.
///
/// The merged stream completes only once every source has completed. The
/// first error from any source terminates the merged stream; the other
/// sources are not torn down by it — they stay subscribed until the
/// merged subscription itself ends.
pub fn merge<T: Send + 'static>(sources: Vec<Stream<T>>) -> Stream<T> {
    Stream::new(move |emitter| {
        if sources.is_empty() {
            emitter.complete();
            return None;
        }
        let open = Arc::new(AtomicUsize::new(sources.len()));
        let mut tasks = Vec::with_capacity(sources.len());
        for source in &sources {
            let mut subscription = source.subscribe(StopToken::never());
            let emitter = emitter.clone();
            let open = open.clone();
            tasks.push(async_global_executor::spawn(async move {
                while let Some(item) = subscription.next().await {
                    match item {
                        Ok(value) => {
                            if !emitter.next(value) {
                                return;
                            }
                        }
                        Err(err) => {
                            emitter.error(err);
                            return;
                        }
                    }
                }
                if open.fetch_sub(1, Ordering::AcqRel) == 1 {
                    emitter.complete();
                }
            }));
        }
        // Dropping the forwarding tasks cancels them and unsubscribes
        // every remaining source.
        Some(Teardown::new(move || drop(tasks)))
    })
}
