mod common;

use common::{recording_context, yaml};
use futures::SinkExt;
use tokio::net::TcpListener;
use tokio_tungstenite::accept_async;
use tokio_tungstenite::tungstenite::Message;

/// Serve one client with `frames`, then keep the socket open
async fn feed(frames: Vec<&'static str>) -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let address = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        let mut socket = accept_async(stream).await.unwrap();
        for frame in frames {
            socket.send(Message::Text(frame.to_string())).await.unwrap();
        }
        let _open = socket;
        std::future::pending::<()>().await;
    });
    format!("ws://{}/live", address)
}

#[tokio::test]
async fn pushed_frames_update_value() {
    let uri = feed(vec!["not json", r#"{"power":1500,"phases":3}"#]).await;

    let (ctx, _) = recording_context();
    let cfg = yaml(&format!("source: websocket\nuri: {}\njq: .power\nscale: 0.001\n", uri));
    let get = ctx.float_getter(&cfg).await.unwrap();
    assert_eq!(get().await.unwrap(), 1.5);
}

#[tokio::test]
async fn string_values_pass_through() {
    let uri = feed(vec![r#"{"state":"charging"}"#]).await;

    let (ctx, _) = recording_context();
    let cfg = yaml(&format!("source: websocket\nuri: {}\njq: .state\n", uri));
    let get = ctx.string_getter(&cfg).await.unwrap();
    assert_eq!(get().await.unwrap(), "charging");
}

#[tokio::test]
async fn invalid_headers_fail_at_construction() {
    let (ctx, _) = recording_context();
    let cfg = yaml("source: websocket\nuri: ws://localhost:1/x\nheaders:\n  \"bad header\": x\n");
    assert!(ctx.float_getter(&cfg).await.is_err());
    assert!(ctx.float_getter(&yaml("source: websocket\nuri: \"not a uri\"\n")).await.is_err());
}
