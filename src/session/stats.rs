use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};

/// Live counters shared by the capture task and the dispatch loop
#[derive(Debug, Default)]
pub struct SessionCounters {
    frames_sent: AtomicU64,
    frames_dropped: AtomicU64,
    chunks_scheduled: AtomicU64,
    chunks_dropped: AtomicU64,
    interruptions: AtomicU64,
    /// Scheduled audio in microseconds
    audio_scheduled_us: AtomicU64,
}

impl SessionCounters {
    pub fn frame_sent(&self) {
        self.frames_sent.fetch_add(1, Ordering::Relaxed);
    }

    pub fn frame_dropped(&self) {
        self.frames_dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn chunk_scheduled(&self, duration_secs: f64) {
        self.chunks_scheduled.fetch_add(1, Ordering::Relaxed);
        self.audio_scheduled_us
            .fetch_add((duration_secs * 1_000_000.0) as u64, Ordering::Relaxed);
    }

    pub fn chunk_dropped(&self) {
        self.chunks_dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn interruption(&self) {
        self.interruptions.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> CounterSnapshot {
        CounterSnapshot {
            frames_sent: self.frames_sent.load(Ordering::Relaxed),
            frames_dropped: self.frames_dropped.load(Ordering::Relaxed),
            chunks_scheduled: self.chunks_scheduled.load(Ordering::Relaxed),
            chunks_dropped: self.chunks_dropped.load(Ordering::Relaxed),
            interruptions: self.interruptions.load(Ordering::Relaxed),
            audio_seconds_scheduled: self.audio_scheduled_us.load(Ordering::Relaxed) as f64
                / 1_000_000.0,
        }
    }
}

/// Point-in-time copy of [`SessionCounters`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct CounterSnapshot {
    /// Outbound frames handed to the transport
    pub frames_sent: u64,

    /// Outbound frames discarded (transport not open or queue full)
    pub frames_dropped: u64,

    /// Inbound chunks placed on the playback timeline
    pub chunks_scheduled: u64,

    /// Inbound chunks discarded (malformed or superseded by an interruption)
    pub chunks_dropped: u64,

    /// Interruption signals received
    pub interruptions: u64,

    /// Total duration of scheduled speech
    pub audio_seconds_scheduled: f64,
}

/// Statistics about a live session
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionStats {
    pub session_id: String,

    /// When the session was opened
    pub started_at: DateTime<Utc>,

    /// Total duration in seconds
    pub duration_secs: f64,

    #[serde(flatten)]
    pub counters: CounterSnapshot,
}

impl SessionStats {
    pub fn collect(session_id: &str, started_at: DateTime<Utc>, counters: &SessionCounters) -> Self {
        let duration = Utc::now().signed_duration_since(started_at);
        Self {
            session_id: session_id.to_string(),
            started_at,
            duration_secs: duration.num_milliseconds() as f64 / 1000.0,
            counters: counters.snapshot(),
        }
    }
}
