//! Connecting replicas to a coordinator.
//!
//! - [`connect_local`] — in-process pipe, one task feeding the coordinator
//! - [`serve`] / [`serve_listener`] — WebSocket accept loop, one JSON text
//!   frame per message
//! - [`connect`] — WebSocket client end, returning the same pair as
//!   [`connect_local`] so a [`Model`](crate::client::Model) is transport-blind

use std::net::SocketAddr;

use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message as WsMessage;

use crate::channel::Channel;
use crate::protocol::{Message, ProtocolError};
use crate::server::SyncServer;

type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// In-process connection. Dropping the returned channel closes it and
/// detaches it from the server.
pub fn connect_local(server: &SyncServer) -> (Channel, mpsc::UnboundedReceiver<Message>) {
    let (to_client, client_rx) = Channel::pair();
    let (to_server, mut server_rx) = Channel::pair();
    let server = server.clone();
    tokio::spawn(async move {
        while let Some(msg) = server_rx.recv().await {
            server.handle_message(&to_client, msg).await;
        }
        server.close_channel(to_client.id()).await;
    });
    (to_server, client_rx)
}

/// Bind `config.bind_addr` and serve WebSocket connections forever.
pub async fn serve(server: SyncServer) -> Result<(), Box<dyn std::error::Error>> {
    let listener = TcpListener::bind(&server.config().bind_addr).await?;
    log::info!("Sync server listening on {}", listener.local_addr()?);
    serve_listener(server, listener).await
}

/// Serve WebSocket connections from an already bound listener.
pub async fn serve_listener(server: SyncServer, listener: TcpListener) -> Result<(), Box<dyn std::error::Error>> {
    loop {
        let (stream, addr) = listener.accept().await?;
        log::debug!("New TCP connection from {addr}");
        let server = server.clone();
        tokio::spawn(async move {
            if let Err(e) = handle_connection(server, stream, addr).await {
                log::error!("Connection error from {addr}: {e}");
            }
        });
    }
}

async fn handle_connection(server: SyncServer, stream: TcpStream, addr: SocketAddr) -> Result<(), BoxError> {
    let ws_stream = tokio_tungstenite::accept_async(stream).await?;
    let (mut ws_sender, mut ws_receiver) = ws_stream.split();
    let (channel, mut outbound) = Channel::pair();
    log::info!("WebSocket connection {} established from {addr}", channel.id());

    let result: Result<(), BoxError> = async {
        loop {
            tokio::select! {
                frame = ws_receiver.next() => match frame {
                    Some(Ok(WsMessage::Text(text))) => match Message::decode(text.as_str()) {
                        Ok(msg) => server.handle_message(&channel, msg).await,
                        Err(e) => log::warn!("Malformed frame from {addr}: {e}"),
                    },
                    Some(Ok(WsMessage::Ping(data))) => ws_sender.send(WsMessage::Pong(data)).await?,
                    Some(Ok(WsMessage::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(e)) => return Err(e.into()),
                },
                msg = outbound.recv() => {
                    let Some(msg) = msg else { break };
                    ws_sender.send(WsMessage::Text(msg.encode()?.into())).await?;
                }
            }
        }
        Ok(())
    }
    .await;

    server.close_channel(channel.id()).await;
    log::info!("WebSocket connection {} from {addr} closed", channel.id());
    result
}

/// Open a WebSocket connection to a coordinator at `url`.
pub async fn connect(url: &str) -> Result<(Channel, mpsc::UnboundedReceiver<Message>), ProtocolError> {
    let (ws_stream, _) = tokio_tungstenite::connect_async(url).await.map_err(|e| {
        log::warn!("Failed to connect to {url}: {e}");
        ProtocolError::ConnectionClosed
    })?;
    let (mut ws_writer, mut ws_reader) = ws_stream.split();
    let (channel, mut outbound) = Channel::pair();
    let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();

    // Writer task: forward outgoing messages to the socket
    tokio::spawn(async move {
        while let Some(msg) = outbound.recv().await {
            let text = match msg.encode() {
                Ok(text) => text,
                Err(e) => {
                    log::error!("Failed to encode {:?}: {e}", msg.msg_type);
                    continue;
                }
            };
            if ws_writer.send(WsMessage::Text(text.into())).await.is_err() {
                break;
            }
        }
        let _ = ws_writer.close().await;
    });

    // Reader task: decode frames until the socket or the model goes away
    tokio::spawn(async move {
        while let Some(frame) = ws_reader.next().await {
            match frame {
                Ok(WsMessage::Text(text)) => match Message::decode(text.as_str()) {
                    Ok(msg) => {
                        if inbound_tx.send(msg).is_err() {
                            break;
                        }
                    }
                    Err(e) => log::warn!("Malformed frame from server: {e}"),
                },
                Ok(WsMessage::Close(_)) | Err(_) => break,
                Ok(_) => {}
            }
        }
        log::debug!("WebSocket reader stopped");
    });

    Ok((channel, inbound_rx))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::MessageType;
    use crate::server::ServerConfig;
    use std::time::Duration;

    #[tokio::test]
    async fn test_local_connection_round_trip() {
        let server = SyncServer::with_memory(ServerConfig::for_testing());
        let (channel, mut rx) = connect_local(&server);
        channel.send(Message::handshake("h")).unwrap();
        let ack = tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(ack.msg_type, MessageType::Handshake);
        assert_eq!(ack.ack_id.as_deref(), Some("h"));
    }

    #[tokio::test]
    async fn test_websocket_round_trip() {
        let server = SyncServer::with_memory(ServerConfig::for_testing());
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let _ = serve_listener(server, listener).await;
        });

        let (channel, mut rx) = connect(&format!("ws://{addr}")).await.unwrap();
        channel.send(Message::handshake("ws-1")).unwrap();
        let ack = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(ack.ack_id.as_deref(), Some("ws-1"));
    }
}
