use futures::{SinkExt, StreamExt};
use std::borrow::Cow;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use url::Url;

use content_sync::channel::{
    ChannelState, ChannelSupervisor, ChannelTransport, ReconnectPolicy, WebSocketTransport,
};
use content_sync::errors::ChannelError;
use content_sync::reconcile::ChangeAction;

async fn loopback() -> (TcpListener, Url) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let url = Url::parse(&format!("ws://{}/ws", addr)).unwrap();
    (listener, url)
}

#[tokio::test]
async fn test_websocket_round_trip_and_normal_close() {
    let (listener, url) = loopback().await;

    let server = tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        let mut ws = tokio_tungstenite::accept_async(stream).await.unwrap();

        let probe = ws.next().await.unwrap().unwrap();
        let probe: serde_json::Value = serde_json::from_str(probe.to_text().unwrap()).unwrap();
        assert_eq!(probe["type"], "ping");

        ws.send(Message::Text(r#"{"type":"connected"}"#.to_string()))
            .await
            .unwrap();
        ws.send(Message::Text(
            r#"{"type":"post_created","data":{"id":11,"title":"Live"},"timestamp":1700000000000}"#
                .to_string(),
        ))
        .await
        .unwrap();
        ws.close(Some(CloseFrame {
            code: CloseCode::Normal,
            reason: Cow::Borrowed("bye"),
        }))
        .await
        .unwrap();
        while let Some(Ok(_)) = ws.next().await {}
    });

    let (tx, mut rx) = mpsc::channel(8);
    let handle = ChannelSupervisor::new(
        url,
        "post",
        Arc::new(WebSocketTransport::new(Duration::from_secs(5))),
        ReconnectPolicy::default(),
    )
    .spawn(tx);

    let event = tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(event.action, ChangeAction::Created);
    assert_eq!(event.payload["id"], 11);
    assert!(event.timestamp.is_some());

    // Server closed with 1000: no reconnect
    let state = tokio::time::timeout(Duration::from_secs(5), handle.join())
        .await
        .unwrap();
    assert_eq!(state, ChannelState::Disconnected);
    server.await.unwrap();
}

#[tokio::test]
async fn test_connect_refused_is_reported() {
    let (listener, url) = loopback().await;
    drop(listener);

    let transport = WebSocketTransport::new(Duration::from_secs(5));
    let result = transport.connect(&url).await;
    assert!(matches!(result, Err(ChannelError::Connect(_))));
}

#[tokio::test]
async fn test_client_teardown_sends_normal_close() {
    let (listener, url) = loopback().await;

    let server = tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        let mut ws = tokio_tungstenite::accept_async(stream).await.unwrap();
        let mut close_code = None;
        while let Some(Ok(message)) = ws.next().await {
            if let Message::Close(frame) = message {
                close_code = frame.map(|f| u16::from(f.code));
                break;
            }
        }
        close_code
    });

    let (tx, _rx) = mpsc::channel(8);
    let handle = ChannelSupervisor::new(
        url,
        "post",
        Arc::new(WebSocketTransport::new(Duration::from_secs(5))),
        ReconnectPolicy::default(),
    )
    .spawn(tx);
    handle
        .subscribe()
        .wait_for(|s| *s == ChannelState::Connected)
        .await
        .unwrap();

    assert_eq!(handle.shutdown().await, ChannelState::Closed);
    let code = tokio::time::timeout(Duration::from_secs(5), server)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(code, Some(1000));
}
