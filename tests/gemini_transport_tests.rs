// Integration tests for the Gemini Live websocket transport
//
// Each test runs a local websocket server that plays the remote endpoint.

mod common;

use base64::Engine;
use common::{eventually, OUTPUT_RATE};
use futures::{SinkExt, StreamExt};
use loqa_live::audio::SimulatedDeviceFactory;
use loqa_live::{
    GeminiLiveConnector, LiveConnector, LiveError, Phase, SendStatus, SessionConfig,
    SessionController, TransportEvent,
};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;

type ServerSocket = WebSocketStream<TcpStream>;

async fn listen() -> (TcpListener, SessionConfig) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let config = SessionConfig {
        endpoint: format!("ws://{}/live", addr),
        api_key: Some("test-key".to_string()),
        connect_timeout: Duration::from_secs(2),
        ..Default::default()
    };
    (listener, config)
}

async fn accept(listener: &TcpListener, uri: Arc<Mutex<Option<String>>>) -> ServerSocket {
    let (stream, _) = listener.accept().await.unwrap();
    tokio_tungstenite::accept_hdr_async(stream, move |req: &Request, resp: Response| {
        *uri.lock().unwrap() = Some(req.uri().to_string());
        Ok::<Response, ErrorResponse>(resp)
    })
    .await
    .unwrap()
}

async fn next_json(ws: &mut ServerSocket) -> serde_json::Value {
    loop {
        match ws.next().await {
            Some(Ok(Message::Text(text))) => return serde_json::from_str(&text).unwrap(),
            Some(Ok(Message::Close(_))) | None => panic!("client closed early"),
            Some(Ok(_)) => continue,
            Some(Err(e)) => panic!("server read failed: {}", e),
        }
    }
}

fn audio_message(samples: usize) -> String {
    let pcm = vec![0u8; samples * 2];
    serde_json::json!({
        "serverContent": {
            "modelTurn": {
                "parts": [{
                    "inlineData": {
                        "mimeType": format!("audio/pcm;rate={}", OUTPUT_RATE),
                        "data": base64::engine::general_purpose::STANDARD.encode(pcm),
                    }
                }]
            }
        }
    })
    .to_string()
}

#[tokio::test]
async fn test_full_session_over_websocket() {
    let (listener, config) = listen().await;
    let uri = Arc::new(Mutex::new(None));

    let server = {
        let uri = Arc::clone(&uri);
        tokio::spawn(async move {
            let mut ws = accept(&listener, uri).await;

            let setup = next_json(&mut ws).await;
            ws.send(Message::Text(r#"{"setupComplete":{}}"#.into()))
                .await
                .unwrap();

            let frame = next_json(&mut ws).await;
            ws.send(Message::Text(audio_message(240))).await.unwrap();
            ws.send(Message::Text(
                r#"{"serverContent":{"interrupted":true}}"#.into(),
            ))
            .await
            .unwrap();
            ws.close(None).await.unwrap();
            (setup, frame)
        })
    };

    let connector = GeminiLiveConnector::new();
    let (transport, mut events) = connector.connect(&config).await.unwrap();

    assert_eq!(events.recv().await, Some(TransportEvent::Opened));
    assert!(transport.is_open());
    assert_eq!(transport.send(vec![0x10, 0x00]).unwrap(), SendStatus::Sent);

    match events.recv().await {
        Some(TransportEvent::Message(payload)) => {
            let audio = payload.audio.expect("audio chunk");
            assert_eq!(audio.data.len(), 480);
            assert_eq!(audio.sample_rate, OUTPUT_RATE);
        }
        other => panic!("expected audio, got {:?}", other),
    }
    match events.recv().await {
        Some(TransportEvent::Message(payload)) => assert!(payload.interrupted),
        other => panic!("expected interruption, got {:?}", other),
    }
    assert_eq!(events.recv().await, Some(TransportEvent::Closed));
    assert!(!transport.is_open());

    let (setup, frame) = server.await.unwrap();
    assert_eq!(setup["setup"]["generationConfig"]["responseModalities"][0], "AUDIO");
    assert_eq!(
        frame["realtimeInput"]["mediaChunks"][0]["mimeType"],
        "audio/pcm;rate=16000"
    );
    assert_eq!(frame["realtimeInput"]["mediaChunks"][0]["data"], "EAA=");

    let uri = uri.lock().unwrap().clone().unwrap();
    assert_eq!(uri, "/live?key=test-key");
}

#[tokio::test]
async fn test_send_before_setup_complete_is_not_connected() {
    let (listener, config) = listen().await;

    let server = tokio::spawn(async move {
        let mut ws = accept(&listener, Arc::new(Mutex::new(None))).await;
        next_json(&mut ws).await;
        // Hold the socket open without completing setup
        tokio::time::sleep(Duration::from_millis(200)).await;
    });

    let (transport, _events) = GeminiLiveConnector::new().connect(&config).await.unwrap();
    assert_eq!(transport.send(vec![0, 0]), Err(LiveError::NotConnected));

    transport.close().await;
    server.abort();
}

#[tokio::test]
async fn test_missing_api_key_is_config_error() {
    let config = SessionConfig {
        api_key: None,
        ..Default::default()
    };

    let result = GeminiLiveConnector::new().connect(&config).await;
    assert!(matches!(result, Err(LiveError::Config { .. })));
}

#[tokio::test]
async fn test_unreachable_endpoint_is_transport_error() {
    let (listener, config) = listen().await;
    drop(listener);

    let result = GeminiLiveConnector::new().connect(&config).await;
    assert!(matches!(result, Err(LiveError::Transport { .. })));
}

#[tokio::test]
async fn test_controller_plays_audio_from_websocket() {
    let (listener, config) = listen().await;

    let server = tokio::spawn(async move {
        let mut ws = accept(&listener, Arc::new(Mutex::new(None))).await;
        next_json(&mut ws).await;
        ws.send(Message::Text(r#"{"setupComplete":{}}"#.into()))
            .await
            .unwrap();
        // 0.25s at 24kHz
        ws.send(Message::Text(audio_message(6000))).await.unwrap();
        // Keep reading until the client hangs up
        while let Some(Ok(message)) = ws.next().await {
            if message.is_close() {
                break;
            }
        }
    });

    let devices = SimulatedDeviceFactory::new(OUTPUT_RATE);
    let mut controller = SessionController::new(
        config,
        Arc::new(GeminiLiveConnector::new()),
        devices.clone(),
    );

    controller.connect().await.unwrap();
    assert_eq!(controller.phase(), Phase::Connected);

    let output = devices.last_output().unwrap();
    eventually("chunk scheduled", || output.started().len() == 1).await;
    assert!((output.started()[0].duration - 0.25).abs() < 1e-6);

    let stats = controller.disconnect().await.unwrap();
    assert_eq!(stats.counters.chunks_scheduled, 1);
    assert!(output.is_released());

    tokio::time::timeout(Duration::from_secs(2), server)
        .await
        .expect("server saw the close")
        .unwrap();
}

#[tokio::test]
async fn test_rejected_setup_reason_reaches_last_error() {
    use std::borrow::Cow;
    use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
    use tokio_tungstenite::tungstenite::protocol::CloseFrame;

    let (listener, config) = listen().await;

    let server = tokio::spawn(async move {
        let mut ws = accept(&listener, Arc::new(Mutex::new(None))).await;
        next_json(&mut ws).await;
        ws.close(Some(CloseFrame {
            code: CloseCode::Policy,
            reason: Cow::Borrowed("models/bogus is not found"),
        }))
        .await
        .unwrap();
    });

    let devices = SimulatedDeviceFactory::new(OUTPUT_RATE);
    let mut controller = SessionController::new(
        config,
        Arc::new(GeminiLiveConnector::new()),
        devices.clone(),
    );

    let err = controller.connect().await.unwrap_err();
    assert!(matches!(err, LiveError::Transport { .. }));
    assert!(err.to_string().contains("models/bogus is not found"), "{}", err);

    let snapshot = controller.snapshot();
    assert_eq!(snapshot.phase, Phase::Idle);
    assert!(snapshot
        .last_error
        .unwrap_or_default()
        .contains("models/bogus is not found"));
    assert!(devices.last_output().unwrap().is_released());
    assert!(devices.last_microphone().unwrap().is_released());

    let _ = server.await;
}
