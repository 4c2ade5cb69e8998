use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::config::SessionConfig;
use super::stats::{SessionCounters, SessionStats};
use crate::audio::codec::{ChunkDecoder, PlayableBuffer};
use crate::audio::{CapturePipeline, DeviceFactory, OutputDevice, PlaybackEvent, PlaybackScheduler};
use crate::error::{LiveError, Result};
use crate::transport::{LiveConnector, LiveTransport, ServerPayload, TransportEvent};

/// Lifecycle phase of the controller
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Phase {
    #[default]
    Idle,
    Connecting,
    Connected,
    Closing,
}

/// The two booleans the UI observes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct SessionState {
    pub connected: bool,
    pub speaking: bool,
}

/// Everything published on the status channel
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SessionSnapshot {
    pub phase: Phase,
    #[serde(flatten)]
    pub state: SessionState,
    /// Why the most recent connect attempt or session failed
    pub last_error: Option<String>,
}

/// What [`SessionController::toggle`] did
#[derive(Debug, Clone)]
pub enum Toggle {
    Connected,
    /// Carries the final statistics of the session that ended
    Disconnected(SessionStats),
}

type StatusSender = Arc<watch::Sender<SessionSnapshot>>;

/// Handle to a running session; the dispatch task owns its components
struct LiveSession {
    session_id: String,
    started_at: DateTime<Utc>,
    counters: Arc<SessionCounters>,
    shutdown: Option<oneshot::Sender<()>>,
    task: JoinHandle<SessionStats>,
}

impl LiveSession {
    fn stats(&self) -> SessionStats {
        SessionStats::collect(&self.session_id, self.started_at, &self.counters)
    }

    /// Stop the dispatch task and wait for its teardown
    async fn finish(mut self) -> SessionStats {
        if let Some(shutdown) = self.shutdown.take() {
            // Task may already have exited on a remote close
            let _ = shutdown.send(());
        }
        match (&mut self.task).await {
            Ok(stats) => stats,
            Err(e) => {
                error!("Session {} dispatch task failed: {}", self.session_id, e);
                self.stats()
            }
        }
    }
}

/// Orchestrates capture, transport and playback for one live session at a time
///
/// Every connect builds fresh devices, a fresh transport and a fresh
/// scheduler; nothing is reused across sessions.
pub struct SessionController {
    config: SessionConfig,
    connector: Arc<dyn LiveConnector>,
    devices: Arc<dyn DeviceFactory>,
    status: StatusSender,
    live: Option<LiveSession>,
}

impl SessionController {
    pub fn new(
        config: SessionConfig,
        connector: Arc<dyn LiveConnector>,
        devices: Arc<dyn DeviceFactory>,
    ) -> Self {
        let (status, _) = watch::channel(SessionSnapshot::default());
        Self {
            config,
            connector,
            devices,
            status: Arc::new(status),
            live: None,
        }
    }

    /// Watch phase, connected and speaking as they change
    pub fn subscribe(&self) -> watch::Receiver<SessionSnapshot> {
        self.status.subscribe()
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        self.status.borrow().clone()
    }

    pub fn phase(&self) -> Phase {
        self.status.borrow().phase
    }

    pub fn state(&self) -> SessionState {
        self.status.borrow().state
    }

    /// Id of the running session, if any
    pub fn session_id(&self) -> Option<&str> {
        self.live.as_ref().map(|live| live.session_id.as_str())
    }

    /// Statistics of the running session
    pub fn stats(&self) -> Option<SessionStats> {
        self.live.as_ref().map(|live| live.stats())
    }

    /// Open devices, connect and wait for the session to open
    ///
    /// On failure every partially opened resource is released and the
    /// controller is back in `Idle` with `last_error` set.
    pub async fn connect(&mut self) -> Result<()> {
        self.reap().await;

        let phase = self.phase();
        if phase != Phase::Idle {
            return Err(LiveError::InvalidState {
                message: format!("cannot connect while {:?}", phase),
            });
        }

        self.config.validate()?;
        let config = self.config.for_new_session();
        info!("Connecting live session {}", config.session_id);

        self.status.send_modify(|s| {
            s.phase = Phase::Connecting;
            s.state = SessionState::default();
            s.last_error = None;
        });
        let mut guard = ConnectGuard::new(Arc::clone(&self.status));

        match self.open_session(&config).await {
            Ok(live) => {
                guard.disarm();
                self.live = Some(live);
                info!("Live session {} connected", config.session_id);
                Ok(())
            }
            Err(e) => {
                guard.disarm();
                warn!("Live session {} failed to connect: {}", config.session_id, e);
                self.status.send_modify(|s| {
                    s.phase = Phase::Idle;
                    s.state = SessionState::default();
                    s.last_error = Some(e.to_string());
                });
                Err(e)
            }
        }
    }

    async fn open_session(&self, config: &SessionConfig) -> Result<LiveSession> {
        // Devices first: no session is opened without a microphone and speaker
        let input = self.devices.open_input(&config.capture_config()).await?;
        let mut capture = CapturePipeline::new(input);

        let output = match self.devices.open_output(&config.output_config()).await {
            Ok(output) => output,
            Err(e) => {
                stop_capture(&mut capture).await;
                return Err(e);
            }
        };

        let (transport, mut events) = match self.connector.connect(config).await {
            Ok(connected) => connected,
            Err(e) => {
                stop_capture(&mut capture).await;
                output.release();
                return Err(e);
            }
        };

        let opened = match tokio::time::timeout(config.connect_timeout, wait_for_open(&mut events))
            .await
        {
            Ok(result) => result,
            Err(_) => Err(LiveError::transport(format!(
                "session did not open within {:?}",
                config.connect_timeout
            ))),
        };
        if let Err(e) = opened {
            abandon(capture, output, transport).await;
            return Err(e);
        }

        let (playback_tx, playback_rx) = mpsc::unbounded_channel();
        let scheduler = PlaybackScheduler::new(output, playback_tx);
        let decoder = ChunkDecoder::new(scheduler.sample_rate());
        let counters = Arc::new(SessionCounters::default());

        if let Err(e) = capture
            .start(Arc::clone(&transport), Arc::clone(&counters))
            .await
        {
            stop_capture(&mut capture).await;
            scheduler.teardown();
            transport.close().await;
            return Err(e);
        }

        let started_at = Utc::now();
        self.status.send_modify(|s| {
            s.phase = Phase::Connected;
            s.state = SessionState {
                connected: true,
                speaking: false,
            };
        });

        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let runtime = LiveRuntime {
            session_id: config.session_id.clone(),
            started_at,
            transport,
            events,
            playback: playback_rx,
            scheduler,
            decoder,
            capture,
            counters: Arc::clone(&counters),
            status: Arc::clone(&self.status),
        };
        let task = tokio::spawn(runtime.run(shutdown_rx));

        Ok(LiveSession {
            session_id: config.session_id.clone(),
            started_at,
            counters,
            shutdown: Some(shutdown_tx),
            task,
        })
    }

    /// Tear down the running session. Idempotent.
    ///
    /// Returns the final statistics, or `None` when nothing was running.
    pub async fn disconnect(&mut self) -> Option<SessionStats> {
        let live = self.live.take()?;
        info!("Disconnecting live session {}", live.session_id);
        Some(live.finish().await)
    }

    /// Disconnect while a session is running, otherwise connect
    pub async fn toggle(&mut self) -> Result<Toggle> {
        self.reap().await;
        if let Some(stats) = self.disconnect().await {
            return Ok(Toggle::Disconnected(stats));
        }
        self.connect().await?;
        Ok(Toggle::Connected)
    }

    /// Collect a session the remote side already ended
    async fn reap(&mut self) {
        let finished = self
            .live
            .as_ref()
            .map(|live| live.task.is_finished())
            .unwrap_or(false);
        if !finished {
            return;
        }
        if let Some(live) = self.live.take() {
            let stats = live.finish().await;
            debug!("Reaped ended session {}", stats.session_id);
        }
    }
}

impl Drop for SessionController {
    fn drop(&mut self) {
        // The dispatch task finishes its teardown on its own
        if let Some(mut live) = self.live.take() {
            if let Some(shutdown) = live.shutdown.take() {
                let _ = shutdown.send(());
            }
        }
    }
}

/// Resets the status to Idle if a connect future is dropped midway
struct ConnectGuard {
    status: StatusSender,
    armed: bool,
}

impl ConnectGuard {
    fn new(status: StatusSender) -> Self {
        Self {
            status,
            armed: true,
        }
    }

    fn disarm(&mut self) {
        self.armed = false;
    }
}

impl Drop for ConnectGuard {
    fn drop(&mut self) {
        if self.armed {
            warn!("Connect cancelled before the session opened");
            self.status.send_modify(|s| {
                s.phase = Phase::Idle;
                s.state = SessionState::default();
            });
        }
    }
}

async fn wait_for_open(events: &mut mpsc::Receiver<TransportEvent>) -> Result<()> {
    loop {
        match events.recv().await {
            Some(TransportEvent::Opened) => return Ok(()),
            Some(TransportEvent::Message(_)) => {
                debug!("Ignoring message received before the session opened");
            }
            Some(TransportEvent::Error(reason)) => return Err(LiveError::transport(reason)),
            Some(TransportEvent::Closed) | None => {
                return Err(LiveError::transport("session closed before opening"))
            }
        }
    }
}

async fn stop_capture(capture: &mut CapturePipeline) {
    if let Err(e) = capture.stop().await {
        warn!("Failed to stop capture: {}", e);
    }
}

async fn abandon(
    mut capture: CapturePipeline,
    output: Arc<dyn OutputDevice>,
    transport: Arc<dyn LiveTransport>,
) {
    stop_capture(&mut capture).await;
    output.release();
    transport.close().await;
}

/// Single dispatch loop of one live session
struct LiveRuntime {
    session_id: String,
    started_at: DateTime<Utc>,
    transport: Arc<dyn LiveTransport>,
    events: mpsc::Receiver<TransportEvent>,
    playback: mpsc::UnboundedReceiver<PlaybackEvent>,
    scheduler: PlaybackScheduler,
    decoder: ChunkDecoder,
    capture: CapturePipeline,
    counters: Arc<SessionCounters>,
    status: StatusSender,
}

impl LiveRuntime {
    async fn run(mut self, mut shutdown: oneshot::Receiver<()>) -> SessionStats {
        let failure = loop {
            tokio::select! {
                biased;
                _ = &mut shutdown => {
                    debug!("Shutdown requested for session {}", self.session_id);
                    break None;
                }
                event = self.events.recv() => match event {
                    Some(TransportEvent::Message(payload)) => {
                        if let Err(e) = self.handle_payload(payload) {
                            error!("Live session {} failed: {}", self.session_id, e);
                            break Some(e.to_string());
                        }
                    }
                    Some(TransportEvent::Opened) => debug!("Duplicate open event ignored"),
                    Some(TransportEvent::Closed) | None => {
                        info!("Live session {} closed by remote", self.session_id);
                        break None;
                    }
                    Some(TransportEvent::Error(reason)) => {
                        error!("Live session {} failed: {}", self.session_id, reason);
                        break Some(LiveError::transport(reason).to_string());
                    }
                },
                Some(event) = self.playback.recv() => self.handle_playback(event),
            }
        };

        self.teardown(failure).await
    }

    /// Audio first, then the interruption flag, so an interrupt carried
    /// with audio silences that audio too
    ///
    /// Returns an error only when the session cannot continue.
    fn handle_payload(&mut self, payload: ServerPayload) -> Result<()> {
        if let Some(chunk) = payload.audio {
            // Read before decoding so an interrupt in between voids this chunk
            let epoch = self.scheduler.epoch();
            match self.decoder.decode(&chunk.data, chunk.sample_rate) {
                Ok(buffer) => self.play(buffer, epoch)?,
                Err(e) if e.is_fatal() => return Err(e),
                Err(e) => {
                    warn!("Dropping audio chunk: {}", e);
                    self.counters.chunk_dropped();
                }
            }
        }

        if payload.interrupted {
            self.decoder.reset();
            let stopped = self.scheduler.interrupt();
            self.counters.interruption();
            info!("Interrupted: {} queued chunks stopped", stopped);
        }

        if payload.turn_complete {
            debug!("Model turn complete");
            let epoch = self.scheduler.epoch();
            match self.decoder.finish_turn() {
                Ok(tail) => self.play(tail, epoch)?,
                Err(e) if e.is_fatal() => return Err(e),
                Err(e) => warn!("Dropping end of turn audio: {}", e),
            }
        }

        Ok(())
    }

    fn play(&self, buffer: PlayableBuffer, epoch: u64) -> Result<()> {
        if buffer.is_empty() {
            return Ok(());
        }
        let duration = buffer.duration();
        match self.scheduler.schedule_in_epoch(buffer, epoch) {
            Ok(Some(_)) => self.counters.chunk_scheduled(duration),
            Ok(None) => self.counters.chunk_dropped(),
            Err(e) if e.is_fatal() => return Err(e),
            Err(e) => {
                warn!("Failed to schedule chunk: {}", e);
                self.counters.chunk_dropped();
            }
        }
        Ok(())
    }

    fn handle_playback(&self, event: PlaybackEvent) {
        let speaking = matches!(event, PlaybackEvent::SpeakingStarted);
        self.status.send_if_modified(|s| {
            if s.phase != Phase::Connected || s.state.speaking == speaking {
                return false;
            }
            s.state.speaking = speaking;
            true
        });
    }

    /// Capture, then playback, then transport; each step idempotent
    async fn teardown(mut self, failure: Option<String>) -> SessionStats {
        self.status.send_modify(|s| s.phase = Phase::Closing);

        stop_capture(&mut self.capture).await;
        self.scheduler.teardown();
        self.transport.close().await;

        self.status.send_modify(|s| {
            s.phase = Phase::Idle;
            s.state = SessionState::default();
            if failure.is_some() {
                s.last_error = failure.clone();
            }
        });

        let stats = SessionStats::collect(&self.session_id, self.started_at, &self.counters);
        info!(
            "Live session {} ended after {:.1}s: {} frames sent, {} dropped, {} chunks played, {} interruptions",
            stats.session_id,
            stats.duration_secs,
            stats.counters.frames_sent,
            stats.counters.frames_dropped,
            stats.counters.chunks_scheduled,
            stats.counters.interruptions
        );
        stats
    }
}
