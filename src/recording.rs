//! Recording coordinator.
//!
//! Maps recording ids to live WebM writers. Entries are spread over
//! [`SHARD_COUNT`] independently locked maps so concurrent recordings do not
//! contend on one lock. An entry is removed from its shard before its writer
//! is closed, so a concurrent `write_frame` either lands before the close or
//! does not find the recording at all.

use anyhow::{anyhow, bail, Context, Result};
use droidrec_webm::{with_webm_extension, Codec, WebmWriter, WriterConfig};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock, Weak};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::capture::{read_lock, write_lock};

/// Number of shard maps.
pub const SHARD_COUNT: usize = 32;

/// 32-bit FNV-1a.
pub fn fnv1a(data: &[u8]) -> u32 {
    let mut hash: u32 = 0x811c_9dc5;
    for &b in data {
        hash ^= u32::from(b);
        hash = hash.wrapping_mul(0x0100_0193);
    }
    hash
}

/// Shard an id belongs to.
pub fn shard_index(id: &str) -> usize {
    fnv1a(id.as_bytes()) as usize % SHARD_COUNT
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Delete a recording file. A file that is already gone is not an error.
fn remove_recording_file(path: &Path) -> Result<()> {
    match std::fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e).with_context(|| format!("Failed to delete recording file {:?}", path)),
    }
}

// ============================================================================
// Types
// ============================================================================

/// Request to start recording a capture session.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct StartRecordingRequest {
    pub session_id: String,
    pub device_id: String,
    /// Container format; only `"webm"` (or empty) is supported.
    #[serde(default)]
    pub format: String,
    /// `"VP8"`, `"VP9"` or `"H264"`. Empty means VP8.
    #[serde(default)]
    pub codec: String,
    /// SPS override, Annex-B.
    #[serde(default)]
    pub sps: Option<Vec<u8>>,
    /// PPS override, Annex-B.
    #[serde(default)]
    pub pps: Option<Vec<u8>>,
    #[serde(default)]
    pub max_duration_secs: Option<u64>,
}

impl StartRecordingRequest {
    pub fn new(session_id: impl Into<String>, device_id: impl Into<String>) -> Self {
        Self {
            session_id: session_id.into(),
            device_id: device_id.into(),
            ..Default::default()
        }
    }

    #[must_use]
    pub fn codec(mut self, codec: impl Into<String>) -> Self {
        self.codec = codec.into();
        self
    }

    #[must_use]
    pub fn max_duration_secs(mut self, secs: u64) -> Self {
        self.max_duration_secs = Some(secs);
        self
    }

    /// Use these parameter sets unless the request already carries its own.
    #[must_use]
    pub fn or_parameter_sets(mut self, sps: Option<&[u8]>, pps: Option<&[u8]>) -> Self {
        if self.sps.is_none() {
            self.sps = sps.map(<[u8]>::to_vec);
        }
        if self.pps.is_none() {
            self.pps = pps.map(<[u8]>::to_vec);
        }
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordingState {
    Recording,
    Stopping,
    Completed,
    Failed,
}

/// Snapshot of one recording.
#[derive(Debug, Clone, Serialize)]
pub struct Recording {
    pub id: String,
    pub session_id: String,
    pub device_id: String,
    pub format: String,
    pub codec: String,
    pub state: RecordingState,
    pub file_path: PathBuf,
    pub frames: u64,
    pub bytes: u64,
    /// Unix milliseconds.
    pub started_at_ms: u64,
    pub stopped_at_ms: Option<u64>,
    pub max_duration_secs: Option<u64>,
    pub file_size: u64,
    pub error: Option<String>,
}

/// Coordinator settings.
#[derive(Debug, Clone)]
pub struct RecorderConfig {
    pub output_dir: PathBuf,
    /// Applied when a request has no max duration.
    pub default_max_duration: Option<Duration>,
}

impl Default for RecorderConfig {
    fn default() -> Self {
        Self {
            output_dir: PathBuf::from("recordings"),
            default_max_duration: None,
        }
    }
}

impl RecorderConfig {
    pub fn new(output_dir: impl Into<PathBuf>) -> Self {
        Self {
            output_dir: output_dir.into(),
            ..Default::default()
        }
    }

    #[must_use]
    pub fn default_max_duration(mut self, duration: Duration) -> Self {
        self.default_max_duration = Some(duration);
        self
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CoordinatorStats {
    pub active: usize,
    pub completed: usize,
    pub failed: usize,
    pub total_frames: u64,
}

struct Entry {
    recording: Recording,
    writer: WebmWriter,
}

struct ActiveRecording {
    entry: Mutex<Entry>,
    cancel: CancellationToken,
    timer: Mutex<Option<JoinHandle<()>>>,
}

impl ActiveRecording {
    fn write(&self, payload: &[u8], timestamp: Duration, keyframe: bool) -> Result<()> {
        let mut entry = lock(&self.entry);
        if entry.recording.state != RecordingState::Recording {
            bail!(
                "recording {} is not accepting frames ({:?})",
                entry.recording.id,
                entry.recording.state
            );
        }

        if let Err(e) = entry.writer.write_frame(payload, timestamp, keyframe) {
            tracing::error!("Recording {} write failed: {}", entry.recording.id, e);
            entry.recording.state = RecordingState::Failed;
            entry.recording.error = Some(e.to_string());
            let id = entry.recording.id.clone();
            return Err(e).with_context(|| format!("Failed to write frame to recording {}", id));
        }
        entry.recording.frames += 1;
        entry.recording.bytes += payload.len() as u64;
        Ok(())
    }
}

type Shard = RwLock<HashMap<String, Arc<ActiveRecording>>>;

// ============================================================================
// Coordinator
// ============================================================================

pub struct RecordingCoordinator {
    config: RecorderConfig,
    shards: Vec<Shard>,
    history: RwLock<HashMap<String, Recording>>,
}

impl RecordingCoordinator {
    pub fn new(config: RecorderConfig) -> Arc<Self> {
        Arc::new(Self {
            config,
            shards: (0..SHARD_COUNT).map(|_| RwLock::new(HashMap::new())).collect(),
            history: RwLock::new(HashMap::new()),
        })
    }

    fn shard(&self, id: &str) -> &Shard {
        &self.shards[shard_index(id)]
    }

    fn lookup(&self, id: &str) -> Option<Arc<ActiveRecording>> {
        read_lock(self.shard(id)).get(id).cloned()
    }

    fn remove(&self, id: &str) -> Option<Arc<ActiveRecording>> {
        write_lock(self.shard(id)).remove(id)
    }

    /// Open a writer for a new recording and register it.
    pub fn start(
        self: &Arc<Self>,
        request: StartRecordingRequest,
        width: u32,
        height: u32,
    ) -> Result<Recording> {
        let format = if request.format.is_empty() {
            "webm".to_string()
        } else {
            request.format.to_ascii_lowercase()
        };
        if format != "webm" {
            bail!("unsupported recording format: {}", request.format);
        }
        let codec = Codec::from_name(&request.codec.to_ascii_uppercase())?;

        let max_duration = match request.max_duration_secs {
            Some(0) => None,
            Some(secs) => Some(Duration::from_secs(secs)),
            None => self.config.default_max_duration,
        };
        // The expiry timer is a tokio task
        let timer_runtime = max_duration
            .map(|_| tokio::runtime::Handle::try_current())
            .transpose()
            .context("a max duration needs a running tokio runtime")?;

        std::fs::create_dir_all(&self.config.output_dir).with_context(|| {
            format!(
                "Failed to create output directory: {:?}",
                self.config.output_dir
            )
        })?;

        let id = Uuid::new_v4().to_string();
        let path = with_webm_extension(self.config.output_dir.join(&id));

        let mut config = WriterConfig::new(&path, width, height)
            .codec(codec)
            .writing_app(format!("droidrec {}", env!("CARGO_PKG_VERSION")));
        if codec == Codec::H264 {
            match (&request.sps, &request.pps) {
                (Some(sps), Some(pps)) => config = config.parameter_sets(sps.clone(), pps.clone()),
                _ => tracing::warn!("Recording {} has no SPS/PPS, CodecPrivate omitted", id),
            }
        }

        let mut writer = WebmWriter::create(config)
            .with_context(|| format!("Failed to create writer for recording {}", id))?;
        writer
            .write_header()
            .with_context(|| format!("Failed to write header for recording {}", id))?;

        let recording = Recording {
            id: id.clone(),
            session_id: request.session_id,
            device_id: request.device_id,
            format,
            codec: codec.codec_id().to_string(),
            state: RecordingState::Recording,
            file_path: path,
            frames: 0,
            bytes: 0,
            started_at_ms: now_ms(),
            stopped_at_ms: None,
            max_duration_secs: max_duration.map(|d| d.as_secs()),
            file_size: 0,
            error: None,
        };

        let active = Arc::new(ActiveRecording {
            entry: Mutex::new(Entry {
                recording: recording.clone(),
                writer,
            }),
            cancel: CancellationToken::new(),
            timer: Mutex::new(None),
        });

        if let (Some(limit), Some(runtime)) = (max_duration, timer_runtime) {
            let handle = runtime.spawn(Self::expire_after(
                Arc::downgrade(self),
                id.clone(),
                limit,
                active.cancel.clone(),
            ));
            *lock(&active.timer) = Some(handle);
        }

        write_lock(self.shard(&id)).insert(id.clone(), active);
        tracing::info!(
            "Recording {} started for session {} ({}x{}, {}) -> {:?}",
            id,
            recording.session_id,
            width,
            height,
            recording.codec,
            recording.file_path
        );
        Ok(recording)
    }

    async fn expire_after(
        coordinator: Weak<Self>,
        id: String,
        limit: Duration,
        cancel: CancellationToken,
    ) {
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = tokio::time::sleep(limit) => {}
        }
        let Some(coordinator) = coordinator.upgrade() else {
            return;
        };
        // An explicit stop may have won the race
        let Some(active) = coordinator.remove(&id) else {
            return;
        };
        tracing::info!("Recording {} reached max duration {:?}", id, limit);
        coordinator.finalize(active, false).await;
    }

    /// Append one encoded frame.
    pub fn write_frame(
        &self,
        id: &str,
        payload: &[u8],
        timestamp: Duration,
        keyframe: bool,
    ) -> Result<()> {
        let active = self
            .lookup(id)
            .ok_or_else(|| anyhow!("recording not found: {}", id))?;
        active.write(payload, timestamp, keyframe)
    }

    /// Stop a recording and close its file.
    pub async fn stop(&self, id: &str) -> Result<Recording> {
        let active = self
            .remove(id)
            .ok_or_else(|| anyhow!("recording not found: {}", id))?;
        Ok(self.finalize(active, true).await)
    }

    /// Stop every active recording. Returns the final snapshots.
    pub async fn stop_all(&self) -> Vec<Recording> {
        let mut stopped = Vec::new();
        for id in self.active_ids() {
            if let Ok(recording) = self.stop(&id).await {
                stopped.push(recording);
            }
        }
        stopped
    }

    async fn finalize(&self, active: Arc<ActiveRecording>, await_timer: bool) -> Recording {
        {
            let mut entry = lock(&active.entry);
            if entry.recording.state == RecordingState::Recording {
                entry.recording.state = RecordingState::Stopping;
            }
        }

        active.cancel.cancel();
        let timer = lock(&active.timer).take();
        if let Some(timer) = timer {
            if await_timer {
                if let Err(e) = timer.await {
                    tracing::debug!("Timeout task ended abnormally: {}", e);
                }
            }
        }

        let recording = {
            let mut entry = lock(&active.entry);
            let closed = entry.writer.close();
            entry.recording.file_size = std::fs::metadata(&entry.recording.file_path)
                .map(|m| m.len())
                .unwrap_or(0);
            entry.recording.stopped_at_ms = Some(now_ms());
            match closed {
                Ok(()) if entry.recording.state == RecordingState::Stopping => {
                    entry.recording.state = RecordingState::Completed;
                }
                Ok(()) => {}
                Err(e) => {
                    tracing::error!("Recording {} close failed: {}", entry.recording.id, e);
                    entry.recording.state = RecordingState::Failed;
                    entry.recording.error.get_or_insert_with(|| e.to_string());
                }
            }
            entry.recording.clone()
        };

        tracing::info!(
            "Recording {} {:?}: {} frames, {} bytes written, file {} bytes",
            recording.id,
            recording.state,
            recording.frames,
            recording.bytes,
            recording.file_size
        );
        write_lock(&self.history).insert(recording.id.clone(), recording.clone());
        recording
    }

    /// Stop a recording if it is still running, delete its file and forget it.
    pub async fn delete(&self, id: &str) -> Result<Recording> {
        if let Some(active) = self.remove(id) {
            self.finalize(active, true).await;
        }
        let recording = read_lock(&self.history)
            .get(id)
            .cloned()
            .ok_or_else(|| anyhow!("recording not found: {}", id))?;
        remove_recording_file(&recording.file_path)?;
        write_lock(&self.history).remove(id);
        tracing::info!("Recording {} deleted: {:?}", id, recording.file_path);
        Ok(recording)
    }

    /// Forget finished recordings that stopped at least `max_age` ago and
    /// delete their files. Active recordings are never touched. Returns the
    /// number removed.
    pub fn cleanup(&self, max_age: Duration) -> Result<usize> {
        let now = now_ms();
        let max_age_ms = max_age.as_millis() as u64;
        let expired: Vec<Recording> = read_lock(&self.history)
            .values()
            .filter(|r| now.saturating_sub(r.stopped_at_ms.unwrap_or(r.started_at_ms)) >= max_age_ms)
            .cloned()
            .collect();

        let mut removed = 0;
        for recording in expired {
            remove_recording_file(&recording.file_path)?;
            write_lock(&self.history).remove(&recording.id);
            removed += 1;
        }
        if removed > 0 {
            tracing::info!("Cleaned up {} recordings older than {:?}", removed, max_age);
        }
        Ok(removed)
    }

    /// Current snapshot of an active or finished recording.
    pub fn get(&self, id: &str) -> Option<Recording> {
        if let Some(active) = self.lookup(id) {
            return Some(lock(&active.entry).recording.clone());
        }
        read_lock(&self.history).get(id).cloned()
    }

    fn active_ids(&self) -> Vec<String> {
        let mut ids = Vec::new();
        for shard in &self.shards {
            ids.extend(read_lock(shard).keys().cloned());
        }
        ids
    }

    pub fn list_active(&self) -> Vec<Recording> {
        let mut out = Vec::new();
        for shard in &self.shards {
            let entries: Vec<_> = read_lock(shard).values().cloned().collect();
            out.extend(entries.iter().map(|a| lock(&a.entry).recording.clone()));
        }
        out
    }

    pub fn stats(&self) -> CoordinatorStats {
        let mut stats = CoordinatorStats::default();
        for recording in self.list_active() {
            stats.active += 1;
            stats.total_frames += recording.frames;
        }
        for recording in read_lock(&self.history).values() {
            match recording.state {
                RecordingState::Completed => stats.completed += 1,
                RecordingState::Failed => stats.failed += 1,
                _ => {}
            }
            stats.total_frames += recording.frames;
        }
        stats
    }
}
