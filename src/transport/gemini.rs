// Gemini Live API transport over a websocket (BidiGenerateContent)

use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use tracing::{debug, error, info, warn};

use super::connector::{LiveConnector, LiveTransport, SendStatus};
use super::events::TransportEvent;
use super::messages::{RealtimeInputMessage, ServerMessage, SetupMessage};
use crate::error::{LiveError, Result};
use crate::session::SessionConfig;

/// Outbound frames buffered before `send` starts dropping
const OUTBOUND_QUEUE: usize = 32;

/// Inbound events buffered for the controller
const EVENT_QUEUE: usize = 256;

/// How long `close` waits for the close frame to be written
const CLOSE_GRACE: Duration = Duration::from_millis(500);

/// Connects to the Gemini Live websocket endpoint
#[derive(Debug, Clone, Default)]
pub struct GeminiLiveConnector;

impl GeminiLiveConnector {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait::async_trait]
impl LiveConnector for GeminiLiveConnector {
    async fn connect(
        &self,
        config: &SessionConfig,
    ) -> Result<(Arc<dyn LiveTransport>, mpsc::Receiver<TransportEvent>)> {
        let api_key = config
            .api_key
            .as_deref()
            .filter(|key| !key.is_empty())
            .ok_or_else(|| LiveError::config("no API key configured"))?;

        // The key travels in the query string; only the endpoint is logged
        let url = format!("{}?key={}", config.endpoint, api_key);
        info!("Connecting to Live endpoint {} (model={})", config.endpoint, config.model);

        let (ws, _response) =
            tokio::time::timeout(config.connect_timeout, tokio_tungstenite::connect_async(url))
                .await
                .map_err(|_| LiveError::transport("timed out connecting to Live endpoint"))?
                .map_err(|e| LiveError::transport(format!("websocket handshake failed: {}", e)))?;

        debug!("Websocket established for session {}", config.session_id);

        let (transport, events) = GeminiLiveTransport::start(ws, config).await?;
        Ok((transport as Arc<dyn LiveTransport>, events))
    }
}

/// One open Live session
///
/// A reader task turns server messages into [`TransportEvent`]s; a writer
/// task owns the sink and drains the bounded outbound queue.
pub struct GeminiLiveTransport {
    open: Arc<AtomicBool>,
    terminated: Arc<AtomicBool>,
    outbound: mpsc::Sender<Vec<u8>>,
    events: Mutex<Option<mpsc::Sender<TransportEvent>>>,
    shutdown: Mutex<Option<oneshot::Sender<()>>>,
    writer: Mutex<Option<JoinHandle<()>>>,
    reader: Mutex<Option<JoinHandle<()>>>,
}

impl GeminiLiveTransport {
    /// Send the setup message on `ws` and spawn the reader and writer tasks
    pub(crate) async fn start<S>(
        mut ws: WebSocketStream<S>,
        config: &SessionConfig,
    ) -> Result<(Arc<Self>, mpsc::Receiver<TransportEvent>)>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let setup = serde_json::to_string(&SetupMessage::from_config(config))
            .map_err(|e| LiveError::transport(format!("failed to encode setup: {}", e)))?;
        ws.send(Message::Text(setup))
            .await
            .map_err(|e| LiveError::transport(format!("failed to send setup: {}", e)))?;

        let (sink, stream) = ws.split();
        let (outbound_tx, outbound_rx) = mpsc::channel(OUTBOUND_QUEUE);
        let (events_tx, events_rx) = mpsc::channel(EVENT_QUEUE);
        let (shutdown_tx, shutdown_rx) = oneshot::channel();

        let open = Arc::new(AtomicBool::new(false));
        let terminated = Arc::new(AtomicBool::new(false));

        let writer = tokio::spawn(write_loop(
            sink,
            outbound_rx,
            shutdown_rx,
            config.input_sample_rate,
        ));

        let reader = tokio::spawn(
            ReadLoop {
                open: Arc::clone(&open),
                terminated: Arc::clone(&terminated),
                events: events_tx.clone(),
                default_rate: config.output_sample_rate,
                session_id: config.session_id.clone(),
            }
            .run(stream),
        );

        let transport = Arc::new(Self {
            open,
            terminated,
            outbound: outbound_tx,
            events: Mutex::new(Some(events_tx)),
            shutdown: Mutex::new(Some(shutdown_tx)),
            writer: Mutex::new(Some(writer)),
            reader: Mutex::new(Some(reader)),
        });

        Ok((transport, events_rx))
    }
}

#[async_trait::async_trait]
impl LiveTransport for GeminiLiveTransport {
    fn send(&self, frame: Vec<u8>) -> Result<SendStatus> {
        if !self.is_open() {
            return Err(LiveError::NotConnected);
        }

        match self.outbound.try_send(frame) {
            Ok(()) => Ok(SendStatus::Sent),
            Err(mpsc::error::TrySendError::Full(_)) => Ok(SendStatus::Dropped),
            Err(mpsc::error::TrySendError::Closed(_)) => Err(LiveError::NotConnected),
        }
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    async fn close(&self) {
        // Claim the terminal event before the server can answer the close
        let first = !self.terminated.swap(true, Ordering::SeqCst);
        self.open.store(false, Ordering::SeqCst);

        if let Some(shutdown) = self.shutdown.lock().take() {
            // Writer already gone if this fails
            let _ = shutdown.send(());
        }

        let writer = self.writer.lock().take();
        if let Some(mut writer) = writer {
            if tokio::time::timeout(CLOSE_GRACE, &mut writer).await.is_err() {
                warn!("Close frame not flushed within {:?}", CLOSE_GRACE);
                writer.abort();
            }
        }

        if let Some(reader) = self.reader.lock().take() {
            reader.abort();
        }

        let events = self.events.lock().take();
        if let Some(events) = events.filter(|_| first) {
            let _ = events.try_send(TransportEvent::Closed);
        }

        info!("Live transport closed");
    }
}

impl Drop for GeminiLiveTransport {
    fn drop(&mut self) {
        self.open.store(false, Ordering::SeqCst);
        if let Some(writer) = self.writer.get_mut().take() {
            writer.abort();
        }
        if let Some(reader) = self.reader.get_mut().take() {
            reader.abort();
        }
    }
}

async fn write_loop<S>(
    mut sink: SplitSink<WebSocketStream<S>, Message>,
    mut frames: mpsc::Receiver<Vec<u8>>,
    mut shutdown: oneshot::Receiver<()>,
    input_rate: u32,
) where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    loop {
        tokio::select! {
            biased;
            _ = &mut shutdown => {
                if let Err(e) = sink.send(Message::Close(None)).await {
                    debug!("Close frame not sent: {}", e);
                }
                break;
            }
            frame = frames.recv() => {
                let Some(frame) = frame else { break };
                let message = RealtimeInputMessage::pcm(&frame, input_rate);
                let text = match serde_json::to_string(&message) {
                    Ok(text) => text,
                    Err(e) => {
                        warn!("Failed to encode audio frame: {}", e);
                        continue;
                    }
                };
                if let Err(e) = sink.send(Message::Text(text)).await {
                    warn!("Websocket write failed: {}", e);
                    break;
                }
            }
        }
    }
    debug!("Websocket writer stopped");
}

struct ReadLoop {
    open: Arc<AtomicBool>,
    terminated: Arc<AtomicBool>,
    events: mpsc::Sender<TransportEvent>,
    default_rate: u32,
    session_id: String,
}

impl ReadLoop {
    async fn run<S>(self, mut stream: SplitStream<WebSocketStream<S>>)
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let terminal = loop {
            let text = match stream.next().await {
                Some(Ok(Message::Text(text))) => text,
                Some(Ok(Message::Binary(bytes))) => match String::from_utf8(bytes) {
                    Ok(text) => text,
                    Err(_) => {
                        warn!("Ignoring non-UTF-8 binary frame");
                        continue;
                    }
                },
                Some(Ok(Message::Close(frame))) => {
                    let detail = match &frame {
                        Some(frame) if frame.reason.is_empty() => format!("code {}", frame.code),
                        Some(frame) => format!("code {}: {}", frame.code, frame.reason),
                        None => "no close frame".to_string(),
                    };
                    info!("Server closed session {} ({})", self.session_id, detail);

                    // A close in answer to the setup message is a rejection
                    if !self.open.load(Ordering::SeqCst) {
                        break TransportEvent::Error(format!(
                            "server closed the session before setup completed ({})",
                            detail
                        ));
                    }
                    break TransportEvent::Closed;
                }
                Some(Ok(_)) => continue,
                Some(Err(e)) => {
                    error!("Websocket error: {}", e);
                    break TransportEvent::Error(e.to_string());
                }
                None => break TransportEvent::Closed,
            };

            if !self.handle_text(&text).await {
                // Receiver dropped: nobody is listening any more
                self.open.store(false, Ordering::SeqCst);
                return;
            }
        };

        self.open.store(false, Ordering::SeqCst);
        if !self.terminated.swap(true, Ordering::SeqCst) {
            let _ = self.events.send(terminal).await;
        }
    }

    /// Returns false once the event receiver is gone
    async fn handle_text(&self, text: &str) -> bool {
        let message = match ServerMessage::parse(text) {
            Ok(message) => message,
            Err(e) => {
                warn!("{}", e);
                return true;
            }
        };

        if let Some(go_away) = &message.go_away {
            warn!(
                "Server will end session {} soon (time left: {})",
                self.session_id,
                go_away.time_left.as_deref().unwrap_or("unknown")
            );
        }

        if message.is_setup_complete() && !self.open.swap(true, Ordering::SeqCst) {
            info!("Live session {} opened", self.session_id);
            if self.events.send(TransportEvent::Opened).await.is_err() {
                return false;
            }
        }

        let Some(content) = message.server_content else {
            return true;
        };

        if !self.open.load(Ordering::SeqCst) {
            debug!("Ignoring server content received before setup completed");
            return true;
        }

        let (payload, decode_error) = content.into_payload(self.default_rate);
        if let Some(e) = decode_error {
            warn!("Dropping audio from server message: {}", e);
        }

        if payload.is_empty() && !payload.turn_complete {
            return true;
        }

        self.events.send(TransportEvent::Message(payload)).await.is_ok()
    }
}
