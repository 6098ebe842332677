
use async_serve::{
    HookFuture, Reply, ReplyBody, Request, Server, ServerConfig, Service, Services,
    UpgradeHandler, WebsocketGate,
};
use async_std::prelude::*;
use http_types::{Result, StatusCode};
use pretty_assertions::assert_eq;
use test_utils::connect;

struct ChatEcho;

impl Service for ChatEcho {
    fn name(&self) -> &str {
        "chat"
    }

    fn handle_websocket<'a>(
        &'a self,
        _req: &'a mut Request,
        gate: &'a mut WebsocketGate,
    ) -> HookFuture<'a, Result<Option<Reply>>> {
        Box::pin(async move {
            gate.connect(UpgradeHandler::new(|mut io| async move {
                let mut buf = [0u8; 4];
                if io.read_exact(&mut buf).await.is_ok() {
                    let _ = io.write_all(b"pong").await;
                    let _ = io.flush().await;
                }
            }));
            Ok(None)
        })
    }
}

struct Handshake;

impl Service for Handshake {
    fn name(&self) -> &str {
        "handshake"
    }

    fn handle_websocket<'a>(
        &'a self,
        _req: &'a mut Request,
        gate: &'a mut WebsocketGate,
    ) -> HookFuture<'a, Result<Option<Reply>>> {
        Box::pin(async move {
            gate.connect(UpgradeHandler::new(|mut io| async move {
                let _ = io.write_all(b"!").await;
                let _ = io.flush().await;
            }));
            let mut reply = Reply::new();
            reply.set_status(StatusCode::SwitchingProtocols);
            reply.insert_header("upgrade", "websocket");
            reply.set_body(ReplyBody::Upgrade);
            Ok(Some(reply))
        })
    }
}

struct Reject;

impl Service for Reject {
    fn name(&self) -> &str {
        "reject"
    }

    fn handle_websocket<'a>(
        &'a self,
        _req: &'a mut Request,
        _gate: &'a mut WebsocketGate,
    ) -> HookFuture<'a, Result<Option<Reply>>> {
        Box::pin(async move {
            let mut reply = Reply::new();
            reply.set_status(StatusCode::Forbidden);
            reply.insert_header("x-reason", "nope");
            Ok(Some(reply))
        })
    }
}

#[async_std::test]
async fn takeover_hands_over_the_raw_socket() -> Result<()> {
    let server = Server::new(ServerConfig::default(), Services::new().with(ChatEcho));
    let (mut client, handle) = connect(&server);

    client
        .write_all(
            b"GET /chat HTTP/1.1\r\nhost: example.com\r\nconnection: upgrade\r\nupgrade: websocket\r\n\r\n",
        )
        .await?;
    client.write_all(b"ping").await?;
    handle.await?;

    assert_eq!(client.received(), "pong");
    Ok(())
}

#[async_std::test]
async fn hook_head_is_written_before_takeover() -> Result<()> {
    let server = Server::new(ServerConfig::default(), Services::new().with(Handshake));
    let (mut client, handle) = connect(&server);

    client
        .write_all(
            b"GET /chat HTTP/1.1\r\nhost: example.com\r\nconnection: upgrade\r\nupgrade: websocket\r\n\r\n",
        )
        .await?;
    handle.await?;

    assert_eq!(
        client.received(),
        "HTTP/1.1 101 Switching Protocols\r\nupgrade: websocket\r\n\r\n!"
    );
    Ok(())
}

#[async_std::test]
async fn unclaimed_upgrade_gets_404() -> Result<()> {
    let server = Server::new(ServerConfig::default(), Services::new());
    let (mut client, handle) = connect(&server);

    client
        .write_all(
            b"GET /chat HTTP/1.1\r\nhost: example.com\r\nconnection: upgrade\r\nupgrade: websocket\r\n\r\n",
        )
        .await?;
    handle.await?;

    assert_eq!(
        client.received(),
        "HTTP/1.1 404 Not Found\r\nconnection: close\r\n\r\n"
    );
    Ok(())
}

#[async_std::test]
async fn rejection_reply_skips_the_handshake() -> Result<()> {
    let server = Server::new(ServerConfig::default(), Services::new().with(Reject));
    let (mut client, handle) = connect(&server);

    client
        .write_all(
            b"GET /chat HTTP/1.1\r\nhost: example.com\r\nconnection: upgrade\r\nupgrade: websocket\r\n\r\n",
        )
        .await?;
    handle.await?;

    assert_eq!(
        client.received(),
        "HTTP/1.1 403 Forbidden\r\nx-reason: nope\r\n\r\n"
    );
    Ok(())
}

#[async_std::test]
async fn upgrade_with_body_is_refused() -> Result<()> {
    let server = Server::new(ServerConfig::default(), Services::new().with(ChatEcho));
    let (mut client, handle) = connect(&server);

    client
        .write_all(
            b"GET /chat HTTP/1.1\r\nhost: example.com\r\nconnection: upgrade\r\nupgrade: websocket\r\ncontent-length: 4\r\n\r\nbody",
        )
        .await?;
    handle.await?;

    assert_eq!(
        client.received(),
        "HTTP/1.1 400 Bad Request\r\nconnection: close\r\n\r\n"
    );
    Ok(())
}
