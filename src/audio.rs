use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;

/// 16-bit stereo PCM
pub const DEFAULT_FRAME_SIZE: usize = 4;

/// 10 ms of 44.1 kHz audio
pub const DEFAULT_FRAMES_PER_TICK: usize = 441;

pub const DEFAULT_TICK: Duration = Duration::from_millis(10);

/// About two seconds of 44.1 kHz stereo PCM
pub const DEFAULT_MAX_QUEUED_BYTES: usize = 2 * 44_100 * DEFAULT_FRAME_SIZE;

/// Lossy inbound audio buffer
///
/// `read` drains everything queued and hands back exactly the requested
/// number of frames, zero-filled when starved. Nothing carries over between
/// reads. Appends past `max_queued` bytes evict the oldest chunks.
#[derive(Debug)]
pub struct AudioStreamBuffer {
    chunks: Mutex<VecDeque<Vec<u8>>>,
    frame_size: usize,
    max_queued: usize,
}

impl AudioStreamBuffer {
    pub fn new(frame_size: usize) -> Self {
        Self::with_limit(frame_size, DEFAULT_MAX_QUEUED_BYTES)
    }

    pub fn with_limit(frame_size: usize, max_queued: usize) -> Self {
        Self {
            chunks: Mutex::new(VecDeque::new()),
            frame_size: frame_size.max(1),
            max_queued,
        }
    }

    pub fn frame_size(&self) -> usize {
        self.frame_size
    }

    /// Queue a payload chunk
    pub fn append(&self, chunk: &[u8]) {
        if chunk.is_empty() {
            return;
        }
        let mut chunks = self.chunks.lock();
        chunks.push_back(chunk.to_vec());
        let mut queued: usize = chunks.iter().map(Vec::len).sum();
        while queued > self.max_queued && chunks.len() > 1 {
            if let Some(oldest) = chunks.pop_front() {
                queued -= oldest.len();
            }
        }
    }

    /// Bytes currently queued
    pub fn queued(&self) -> usize {
        self.chunks.lock().iter().map(Vec::len).sum()
    }

    /// Bytes a read of `frames` returns; never more than the queue limit
    fn read_len(&self, frames: usize) -> usize {
        let max_frames = (self.max_queued / self.frame_size).max(1);
        frames.min(max_frames) * self.frame_size
    }

    /// Drain the queue into exactly `frames * frame_size` bytes, capped at the
    /// queue limit
    pub fn read(&self, frames: usize) -> Vec<u8> {
        let want = self.read_len(frames);
        let mut out = Vec::with_capacity(want);
        for chunk in self.chunks.lock().drain(..) {
            if out.len() < want {
                let take = (want - out.len()).min(chunk.len());
                out.extend_from_slice(&chunk[..take]);
            }
        }
        out.resize(want, 0);
        out
    }

    /// Like [`read`](Self::read) but also reports starvation
    pub fn read_frames(&self, frames: usize) -> (Vec<u8>, bool) {
        let starved = self.queued() < self.read_len(frames);
        (self.read(frames), starved)
    }
}

impl Default for AudioStreamBuffer {
    fn default() -> Self {
        Self::new(DEFAULT_FRAME_SIZE)
    }
}

/// Counters kept by a [`PlaybackPoller`]
#[derive(Debug, Default)]
pub struct PollerStats {
    pub reads: AtomicU64,
    pub starved: AtomicU64,
}

/// Drains a session's buffer at playback rate while the session plays
pub struct PlaybackPoller {
    stats: Arc<PollerStats>,
    stop_tx: Option<broadcast::Sender<()>>,
    task_handle: Option<tokio::task::JoinHandle<()>>,
}

impl PlaybackPoller {
    /// Start polling `buffer` every `tick`
    pub fn start(buffer: Arc<AudioStreamBuffer>, frames_per_tick: usize, tick: Duration) -> Self {
        let (stop_tx, mut stop_rx) = broadcast::channel(1);
        let stats = Arc::new(PollerStats::default());
        let task_stats = stats.clone();

        let handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval(tick);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = stop_rx.recv() => break,
                    _ = interval.tick() => {
                        let (_frames, starved) = buffer.read_frames(frames_per_tick);
                        task_stats.reads.fetch_add(1, Ordering::Relaxed);
                        if starved {
                            task_stats.starved.fetch_add(1, Ordering::Relaxed);
                        }
                    }
                }
            }
        });

        Self {
            stats,
            stop_tx: Some(stop_tx),
            task_handle: Some(handle),
        }
    }

    pub fn stats(&self) -> &PollerStats {
        &self.stats
    }

    pub async fn stop(&mut self) {
        if let Some(tx) = self.stop_tx.take() {
            let _ = tx.send(());
        }
        if let Some(handle) = self.task_handle.take() {
            let _ = tokio::time::timeout(Duration::from_millis(500), handle).await;
        }
        tracing::debug!(
            reads = self.stats.reads.load(Ordering::Relaxed),
            starved = self.stats.starved.load(Ordering::Relaxed),
            "playback poller stopped"
        );
    }
}

impl Drop for PlaybackPoller {
    fn drop(&mut self) {
        if let Some(handle) = self.task_handle.take() {
            handle.abort();
        }
    }
}
