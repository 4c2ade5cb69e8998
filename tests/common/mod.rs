// Shared fixtures for integration tests: a scripted remote endpoint
#![allow(dead_code)]

use loqa_live::error::{LiveError, Result};
use loqa_live::transport::{LiveConnector, LiveTransport, SendStatus, ServerPayload, TransportEvent};
use loqa_live::session::{SessionConfig, SessionSnapshot};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, watch};

pub const OUTPUT_RATE: u32 = 24000;

/// Transport whose open state is driven by the test
#[derive(Default)]
pub struct ScriptedTransport {
    open: AtomicBool,
    close_calls: AtomicUsize,
    sent: Mutex<Vec<Vec<u8>>>,
}

impl ScriptedTransport {
    pub fn sent(&self) -> Vec<Vec<u8>> {
        self.sent.lock().unwrap().clone()
    }

    pub fn close_calls(&self) -> usize {
        self.close_calls.load(Ordering::SeqCst)
    }
}

#[async_trait::async_trait]
impl LiveTransport for ScriptedTransport {
    fn send(&self, frame: Vec<u8>) -> Result<SendStatus> {
        if !self.is_open() {
            return Err(LiveError::NotConnected);
        }
        self.sent.lock().unwrap().push(frame);
        Ok(SendStatus::Sent)
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    async fn close(&self) {
        self.open.store(false, Ordering::SeqCst);
        self.close_calls.fetch_add(1, Ordering::SeqCst);
    }
}

/// The test's end of one connected session
pub struct RemoteHandle {
    pub events: mpsc::Sender<TransportEvent>,
    pub transport: Arc<ScriptedTransport>,
    pub config: SessionConfig,
}

impl RemoteHandle {
    pub async fn open(&self) {
        self.transport.open.store(true, Ordering::SeqCst);
        self.events.send(TransportEvent::Opened).await.unwrap();
    }

    /// Send `secs` of silence as 16-bit PCM at the output rate
    pub async fn audio(&self, secs: f64) {
        let samples = (secs * OUTPUT_RATE as f64).round() as usize;
        self.raw_audio(vec![0u8; samples * 2]).await;
    }

    pub async fn raw_audio(&self, data: Vec<u8>) {
        self.events
            .send(TransportEvent::Message(ServerPayload::audio(data, OUTPUT_RATE)))
            .await
            .unwrap();
    }

    pub async fn interrupt(&self) {
        self.events
            .send(TransportEvent::Message(ServerPayload::interrupted()))
            .await
            .unwrap();
    }

    /// One message carrying `secs` of audio and the interruption flag
    pub async fn audio_with_interrupt(&self, secs: f64) {
        let samples = (secs * OUTPUT_RATE as f64).round() as usize;
        let payload = ServerPayload {
            interrupted: true,
            ..ServerPayload::audio(vec![0u8; samples * 2], OUTPUT_RATE)
        };
        self.events.send(TransportEvent::Message(payload)).await.unwrap();
    }

    pub async fn close(&self) {
        let _ = self.events.send(TransportEvent::Closed).await;
    }

    pub async fn fail(&self, reason: &str) {
        let _ = self.events.send(TransportEvent::Error(reason.to_string())).await;
    }
}

/// Connector that hands every session's remote end to the test
pub struct ScriptedConnector {
    auto_open: bool,
    reject: Mutex<Option<String>>,
    connects: AtomicUsize,
    remotes: mpsc::UnboundedSender<RemoteHandle>,
}

impl ScriptedConnector {
    pub fn new(auto_open: bool) -> (Arc<Self>, mpsc::UnboundedReceiver<RemoteHandle>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let connector = Arc::new(Self {
            auto_open,
            reject: Mutex::new(None),
            connects: AtomicUsize::new(0),
            remotes: tx,
        });
        (connector, rx)
    }

    /// Make every following connect fail as if the endpoint refused it
    pub fn reject_with(&self, reason: &str) {
        *self.reject.lock().unwrap() = Some(reason.to_string());
    }

    pub fn connects(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }
}

#[async_trait::async_trait]
impl LiveConnector for ScriptedConnector {
    async fn connect(
        &self,
        config: &SessionConfig,
    ) -> Result<(Arc<dyn LiveTransport>, mpsc::Receiver<TransportEvent>)> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        if let Some(reason) = self.reject.lock().unwrap().clone() {
            return Err(LiveError::transport(reason));
        }

        let (tx, rx) = mpsc::channel(64);
        let transport = Arc::new(ScriptedTransport::default());
        if self.auto_open {
            transport.open.store(true, Ordering::SeqCst);
            tx.try_send(TransportEvent::Opened).unwrap();
        }

        let _ = self.remotes.send(RemoteHandle {
            events: tx,
            transport: Arc::clone(&transport),
            config: config.clone(),
        });
        Ok((transport, rx))
    }
}

/// Wait until `status` satisfies `f`, failing the test after two seconds
pub async fn wait_for_status<F>(status: &mut watch::Receiver<SessionSnapshot>, f: F) -> SessionSnapshot
where
    F: FnMut(&SessionSnapshot) -> bool,
{
    tokio::time::timeout(Duration::from_secs(2), status.wait_for(f))
        .await
        .expect("timed out waiting for status")
        .expect("status channel closed")
        .clone()
}

/// Poll `condition` until it holds, failing the test after two seconds
pub async fn eventually<F>(what: &str, mut condition: F)
where
    F: FnMut() -> bool,
{
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    while !condition() {
        if tokio::time::Instant::now() > deadline {
            panic!("timed out waiting for {}", what);
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}
