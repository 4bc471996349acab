use crate::signaling::handler::MessageHandler;
use crate::signaling::messages::{ClientMessage, ServerMessage};
use crate::utils::Result;
use futures_util::{SinkExt, StreamExt};
use log::{debug, error, info, warn};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::accept_async;
use tokio_tungstenite::tungstenite::Message;

pub struct SignalingServer {
    address: String,
    handler: Arc<MessageHandler>,
}

impl SignalingServer {
    pub fn new(address: impl Into<String>, handler: Arc<MessageHandler>) -> Self {
        let address = address.into();
        info!("Creating new SignalingServer on {}", address);
        Self { address, handler }
    }

    pub async fn run(&self) -> Result<()> {
        let listener = TcpListener::bind(&self.address).await?;
        info!("Server successfully bound to {}", self.address);
        Self::serve(listener, self.handler.clone()).await
    }

    /// Accept loop over an already bound listener.
    pub async fn serve(listener: TcpListener, handler: Arc<MessageHandler>) -> Result<()> {
        loop {
            let (stream, addr) = listener.accept().await?;
            info!("New connection from: {}", addr);
            let handler = handler.clone();

            tokio::spawn(async move {
                if let Err(e) = Self::handle_connection(stream, addr, handler).await {
                    error!("Connection error from {}: {}", addr, e);
                }
            });
        }
    }

    pub async fn handle_connection(
        stream: TcpStream,
        addr: SocketAddr,
        handler: Arc<MessageHandler>,
    ) -> Result<()> {
        let ws_stream = accept_async(stream).await?;
        let (mut ws_sender, mut ws_receiver) = ws_stream.split();
        let (connection_id, mut outbox) = handler.relay().connect();
        info!("{} registered as {}", addr, connection_id);

        // Outbox order is send order, which keeps signals FIFO per pair.
        let writer_id = connection_id.clone();
        let writer = tokio::spawn(async move {
            while let Some(message) = outbox.recv().await {
                let text = match serde_json::to_string(&message) {
                    Ok(text) => text,
                    Err(e) => {
                        warn!("Failed to encode message for {}: {}", writer_id, e);
                        continue;
                    }
                };
                if let Err(e) = ws_sender.send(Message::Text(text)).await {
                    debug!("Writer for {} stopped: {}", writer_id, e);
                    break;
                }
            }
            let _ = ws_sender.close().await;
        });

        let outcome = Self::read_loop(&connection_id, &mut ws_receiver, &handler).await;

        handler.handle_disconnect(&connection_id);
        info!("{} ({}) disconnected", connection_id, addr);
        let _ = writer.await;
        outcome
    }

    async fn read_loop<S>(connection_id: &str, ws_receiver: &mut S, handler: &MessageHandler) -> Result<()>
    where
        S: futures_util::Stream<Item = std::result::Result<Message, tokio_tungstenite::tungstenite::Error>>
            + Unpin,
    {
        while let Some(msg) = ws_receiver.next().await {
            let text = match msg? {
                Message::Text(text) => text,
                Message::Close(_) => break,
                _ => continue,
            };

            let message: ClientMessage = match serde_json::from_str(&text) {
                Ok(message) => message,
                Err(e) => {
                    warn!("Malformed frame from {}: {}", connection_id, e);
                    Self::reply_error(handler, connection_id, format!("malformed message: {}", e));
                    continue;
                }
            };

            if let Err(e) = handler.handle_message(connection_id, message) {
                warn!("Failed to handle message from {}: {}", connection_id, e);
                Self::reply_error(handler, connection_id, e.to_string());
            }
        }
        Ok(())
    }

    fn reply_error(handler: &MessageHandler, connection_id: &str, message: String) {
        handler
            .relay()
            .send_to(connection_id, ServerMessage::Error { message });
    }
}
