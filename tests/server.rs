use futures_util::{SinkExt, StreamExt};
use meshcall::client::SignalingClient;
use meshcall::room::RosterStore;
use meshcall::signaling::{ClientMessage, MessageHandler, ServerMessage, SignalingRelay, SignalingServer};
use meshcall::types::SignalKind;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tokio_tungstenite::tungstenite::Message;

async fn start_relay() -> (String, Arc<MessageHandler>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let url = format!("ws://{}", listener.local_addr().unwrap());
    let handler = Arc::new(MessageHandler::new(Arc::new(SignalingRelay::new(Arc::new(RosterStore::new())))));
    tokio::spawn(SignalingServer::serve(listener, handler.clone()));
    (url, handler)
}

async fn next(inbound: &mut mpsc::UnboundedReceiver<ServerMessage>) -> ServerMessage {
    tokio::time::timeout(Duration::from_secs(5), inbound.recv())
        .await
        .expect("relay went quiet")
        .expect("relay closed the connection")
}

async fn welcomed(url: &str) -> (String, SignalingClient) {
    let mut client = SignalingClient::connect(url).await.unwrap();
    match next(&mut client.inbound).await {
        ServerMessage::Welcome { id } => (id, client),
        other => panic!("expected welcome, got {:?}", other),
    }
}

#[tokio::test]
async fn join_and_relay_over_websockets() {
    let (url, handler) = start_relay().await;
    let (a_id, mut a) = welcomed(&url).await;
    let (b_id, mut b) = welcomed(&url).await;

    a.outbound
        .send(ClientMessage::JoinRoom { room_key: "r1".into(), display_name: "Ada".into() })
        .unwrap();
    assert!(matches!(next(&mut a.inbound).await, ServerMessage::Roster { participants } if participants.len() == 1));

    b.outbound
        .send(ClientMessage::JoinRoom { room_key: "r1".into(), display_name: "Bob".into() })
        .unwrap();
    assert_eq!(
        next(&mut a.inbound).await,
        ServerMessage::ParticipantJoined { id: b_id.clone(), display_name: "Bob".into() }
    );
    assert!(matches!(next(&mut a.inbound).await, ServerMessage::Roster { participants } if participants.len() == 2));
    assert!(matches!(next(&mut b.inbound).await, ServerMessage::Roster { participants } if participants.len() == 2));

    for n in 0..5 {
        a.outbound
            .send(ClientMessage::Signal {
                kind: SignalKind::IceCandidate,
                recipient_id: b_id.clone(),
                ciphertext: format!("c{}", n),
            })
            .unwrap();
    }
    for n in 0..5 {
        assert_eq!(
            next(&mut b.inbound).await,
            ServerMessage::Signal {
                kind: SignalKind::IceCandidate,
                sender_id: a_id.clone(),
                ciphertext: format!("c{}", n),
            }
        );
    }

    drop(b);
    assert_eq!(next(&mut a.inbound).await, ServerMessage::ParticipantLeft { id: b_id });
    assert!(matches!(next(&mut a.inbound).await, ServerMessage::Roster { participants } if participants.len() == 1));
    assert_eq!(handler.relay().roster().snapshot("r1").len(), 1);
}

async fn read_frame(socket: &mut WebSocketStream<MaybeTlsStream<TcpStream>>) -> ServerMessage {
    loop {
        let frame = tokio::time::timeout(Duration::from_secs(5), socket.next())
            .await
            .expect("relay went quiet")
            .expect("socket closed")
            .unwrap();
        if let Message::Text(text) = frame {
            return serde_json::from_str(&text).unwrap();
        }
    }
}

#[tokio::test]
async fn malformed_frame_gets_an_error_and_keeps_the_connection() {
    let (url, _handler) = start_relay().await;
    let (mut socket, _) = connect_async(url.as_str()).await.unwrap();
    assert!(matches!(read_frame(&mut socket).await, ServerMessage::Welcome { .. }));

    socket.send(Message::Text("{\"message_type\":\"teleport\"}".into())).await.unwrap();
    let join = ClientMessage::JoinRoom { room_key: "r".into(), display_name: "Ada".into() };
    socket.send(Message::Text(serde_json::to_string(&join).unwrap())).await.unwrap();

    assert!(matches!(read_frame(&mut socket).await, ServerMessage::Error { .. }));
    assert!(matches!(
        read_frame(&mut socket).await,
        ServerMessage::Roster { participants } if participants[0].name == "Ada"
    ));
}
