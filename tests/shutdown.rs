
use std::time::Duration;

use async_serve::{
    HookFuture, Lifecycle, PushCapability, Reply, Request, Server, ServerConfig, Service,
    Services, StopReason,
};
use async_std::prelude::*;
use async_std::task;
use http_types::Result;
use pretty_assertions::assert_eq;
use test_utils::{await_contains, connect};

struct Pending;

impl Service for Pending {
    fn name(&self) -> &str {
        "pending"
    }

    fn handle_request<'a>(
        &'a self,
        _req: &'a mut Request,
        _push: &'a mut PushCapability,
    ) -> HookFuture<'a, Result<Option<Reply>>> {
        Box::pin(async move {
            async_std::future::pending::<()>().await;
            Ok(None)
        })
    }
}

struct Boom;

impl Service for Boom {
    fn name(&self) -> &str {
        "boom"
    }

    fn handle_request<'a>(
        &'a self,
        _req: &'a mut Request,
        _push: &'a mut PushCapability,
    ) -> HookFuture<'a, Result<Option<Reply>>> {
        Box::pin(async move { Err(http_types::format_err!("boom")) })
    }
}

#[async_std::test]
async fn stop_drains_in_flight_requests() -> Result<()> {
    let server = Server::new(ServerConfig::default(), Services::new().with(Pending));
    let (mut client, handle) = connect(&server);

    client
        .write_all(b"GET / HTTP/1.1\r\nhost: example.com\r\n\r\n")
        .await?;
    task::sleep(Duration::from_millis(50)).await;

    let reason = server.stop(StopReason::Manual).await;
    assert_eq!(reason, StopReason::Manual);
    handle.await?;

    let received = client.received();
    assert!(received.starts_with("HTTP/1.1 503 Service Unavailable\r\n"));
    assert!(received.contains("connection: close\r\n"));
    assert!(received.contains("content-length: 0\r\n"));
    assert_eq!(server.lifecycle(), Lifecycle::Stopped);
    Ok(())
}

#[async_std::test]
async fn slow_handler_times_out() -> Result<()> {
    let mut config = ServerConfig::default();
    config.response_timeout = Some(Duration::from_millis(100));
    let server = Server::new(config, Services::new().with(Pending));
    let (mut client, handle) = connect(&server);

    client
        .write_all(b"GET / HTTP/1.1\r\nhost: example.com\r\n\r\n")
        .await?;
    handle.await?;

    let received = client.received();
    assert!(received.starts_with("HTTP/1.1 504 "));
    assert!(received.contains("connection: close\r\n"));
    Ok(())
}

#[async_std::test]
async fn internal_error_stops_the_server() -> Result<()> {
    let mut config = ServerConfig::default();
    config.stop_on_internal_error = true;
    config.expose_internal_errors = true;
    let server = Server::new(config, Services::new().with(Boom));
    let (mut client, handle) = connect(&server);

    client
        .write_all(b"GET / HTTP/1.1\r\nhost: example.com\r\nconnection: close\r\n\r\n")
        .await?;
    handle.await?;

    let received = client.received();
    assert!(received.starts_with("HTTP/1.1 500 Internal Server Error\r\n"));
    assert!(received.ends_with("boom"));

    server.stopped().await;
    assert_eq!(server.stop(StopReason::Manual).await, StopReason::InternalError);
    assert_eq!(server.lifecycle(), Lifecycle::Stopped);
    Ok(())
}

#[async_std::test]
async fn requests_after_stop_are_refused() -> Result<()> {
    let server = Server::new(ServerConfig::default(), Services::new().with(Pending));
    server.stop(StopReason::Manual).await;

    let (mut client, handle) = connect(&server);
    client
        .write_all(b"GET / HTTP/1.1\r\nhost: example.com\r\n\r\n")
        .await?;
    handle.await?;

    assert!(client.received().is_empty());
    Ok(())
}

#[async_std::test]
async fn stop_callbacks_run_during_shutdown() -> Result<()> {
    let server = Server::new(ServerConfig::default(), Services::new());
    let (tx, rx) = async_channel::bounded(1);
    server.on_stop(move || async move {
        let _ = tx.send(()).await;
        Ok(())
    });

    server.stop(StopReason::Manual).await;
    assert!(rx.try_recv().is_ok());
    Ok(())
}

#[async_std::test]
async fn pending_stream_ends_on_stop() -> Result<()> {
    let server = Server::new(ServerConfig::default(), Services::new().with(Pending));
    let (mut client, handle) = connect(&server);

    client
        .write_all(b"GET / HTTP/1.1\r\nhost: example.com\r\n\r\n")
        .await?;
    task::sleep(Duration::from_millis(50)).await;
    assert!(client.received().is_empty());

    server.stop(StopReason::Manual).await;
    handle.await?;
    await_contains(&client, "HTTP/1.1 503").await;
    Ok(())
}
