//! Device Recorder: captures an Android screen and records it to WebM.
//!
//! H.264 backends (scrcpy, screenrecord) are recorded to `<output-dir>/<id>.webm`.
//! The screencap backend saves numbered PNG snapshots instead.
//!
//! Usage:
//!   recorder --device <serial> [options]
//!
//! Options:
//!   --device <serial>        Device serial (required)
//!   --adb <path>             adb binary (default: adb)
//!   --server <path>          Local scrcpy server jar (default: scrcpy-server)
//!   --port <port>            Local forwarded port (default: 27183)
//!   --max-size <px>          Longest side, 0 = native (default: 720)
//!   --bitrate <bps>          Initial bitrate (default: 4000000)
//!   --fps <n>                Max frame rate (default: 30)
//!   --raw                    Raw Annex-B stream, no frame headers
//!   --backend <name>         scrcpy | screenrecord | screencap (default: scrcpy)
//!   --output-dir <dir>       Output directory (default: recordings)
//!   --duration <seconds>     Stop after N seconds (default: Ctrl+C)
//!   --max-reconnects <n>     Reconnection attempts, 0 = unlimited (default: 5)
//!   --request <file>         Recording request JSON
//!   --quality <0-100>        Set encoder quality once streaming
//!   --codec <name>           Track codec: H264 | VP8 | VP9 (default: H264)

use anyhow::{bail, Context, Result};
use droidrec::adb::DeviceBridge;
use droidrec::capture::{
    BackendKind, CaptureBackend, CaptureOptions, ReconnectPolicy, StreamMode,
};
use droidrec::frame::{Frame, FrameFormat};
use droidrec::pool::BufferPool;
use droidrec::recording::{RecorderConfig, Recording, RecordingCoordinator, StartRecordingRequest};
use droidrec_webm::ebml::{probe, ProbeInfo};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

// ---------------------------------------------------------------------------
// CLI
// ---------------------------------------------------------------------------

#[derive(Debug)]
struct Args {
    device: String,
    adb: String,
    server: PathBuf,
    port: u16,
    max_size: u32,
    bitrate: u32,
    fps: u32,
    raw: bool,
    backend: BackendKind,
    output_dir: PathBuf,
    duration_secs: Option<u64>,
    max_reconnects: u32,
    request: Option<PathBuf>,
    quality: Option<u8>,
    codec: String,
}

impl Default for Args {
    fn default() -> Self {
        Self {
            device: String::new(),
            adb: "adb".to_string(),
            server: PathBuf::from("scrcpy-server"),
            port: 27183,
            max_size: 720,
            bitrate: 4_000_000,
            fps: 30,
            raw: false,
            backend: BackendKind::Scrcpy,
            output_dir: PathBuf::from("recordings"),
            duration_secs: None,
            max_reconnects: 5,
            request: None,
            quality: None,
            codec: "H264".to_string(),
        }
    }
}

fn flag_value<'a>(args: &'a [String], i: usize) -> Result<&'a str> {
    args.get(i + 1)
        .map(String::as_str)
        .with_context(|| format!("{} needs a value", args[i]))
}

fn parse_number<T: std::str::FromStr>(args: &[String], i: usize) -> Result<T> {
    let value = flag_value(args, i)?;
    value
        .parse()
        .ok()
        .with_context(|| format!("invalid value for {}: {}", args[i], value))
}

fn parse_args(args: &[String]) -> Result<Args> {
    let mut parsed = Args::default();

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--device" => parsed.device = flag_value(args, i)?.to_string(),
            "--adb" => parsed.adb = flag_value(args, i)?.to_string(),
            "--server" => parsed.server = PathBuf::from(flag_value(args, i)?),
            "--port" => parsed.port = parse_number(args, i)?,
            "--max-size" => parsed.max_size = parse_number(args, i)?,
            "--bitrate" => parsed.bitrate = parse_number(args, i)?,
            "--fps" => parsed.fps = parse_number(args, i)?,
            "--backend" => parsed.backend = flag_value(args, i)?.parse()?,
            "--output-dir" => parsed.output_dir = PathBuf::from(flag_value(args, i)?),
            "--duration" => parsed.duration_secs = Some(parse_number(args, i)?),
            "--max-reconnects" => parsed.max_reconnects = parse_number(args, i)?,
            "--request" => parsed.request = Some(PathBuf::from(flag_value(args, i)?)),
            "--quality" => parsed.quality = Some(parse_number(args, i)?),
            "--codec" => parsed.codec = flag_value(args, i)?.to_ascii_uppercase(),
            "--raw" => {
                parsed.raw = true;
                i += 1;
                continue;
            }
            "--help" | "-h" => {
                print_usage();
                std::process::exit(0);
            }
            other => bail!("unknown argument: {}", other),
        }
        i += 2;
    }

    if parsed.device.is_empty() {
        bail!("--device is required");
    }
    Ok(parsed)
}

fn print_usage() {
    println!("Device Recorder: records an Android screen to WebM");
    println!();
    println!("Usage: recorder --device <serial> [options]");
    println!();
    println!("Options:");
    println!("  --adb <path>             adb binary (default: adb)");
    println!("  --server <path>          Local scrcpy server jar (default: scrcpy-server)");
    println!("  --port <port>            Local forwarded port (default: 27183)");
    println!("  --max-size <px>          Longest side, 0 = native (default: 720)");
    println!("  --bitrate <bps>          Initial bitrate (default: 4000000)");
    println!("  --fps <n>                Max frame rate (default: 30)");
    println!("  --raw                    Raw Annex-B stream, no frame headers");
    println!("  --backend <name>         scrcpy | screenrecord | screencap (default: scrcpy)");
    println!("  --output-dir <dir>       Output directory (default: recordings)");
    println!("  --duration <seconds>     Stop after N seconds (default: Ctrl+C)");
    println!("  --max-reconnects <n>     Reconnection attempts, 0 = unlimited (default: 5)");
    println!("  --request <file>         Recording request JSON");
    println!("  --quality <0-100>        Set encoder quality once streaming");
    println!("  --codec <name>           Track codec: H264 | VP8 | VP9 (default: H264)");
    println!();
    println!("Examples:");
    println!("  recorder --device emulator-5554 --duration 60");
    println!("  recorder --device R58M123 --backend screenrecord --output-dir /tmp/rec");
}

// ---------------------------------------------------------------------------
// Recording
// ---------------------------------------------------------------------------

/// Maps frames to track timestamps relative to the first written frame.
#[derive(Debug, Default)]
struct Timeline {
    first_pts: Option<u64>,
    first_instant: Option<Instant>,
}

impl Timeline {
    fn timestamp(&mut self, frame: &Frame) -> Duration {
        match frame.pts {
            Some(pts) => {
                let first = *self.first_pts.get_or_insert(pts);
                Duration::from_micros(pts.saturating_sub(first))
            }
            None => {
                let first = *self.first_instant.get_or_insert(frame.captured_at);
                frame.captured_at.saturating_duration_since(first)
            }
        }
    }
}

fn load_request(args: &Args) -> Result<StartRecordingRequest> {
    match &args.request {
        Some(path) => {
            let text = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read request {:?}", path))?;
            let mut request: StartRecordingRequest = serde_json::from_str(&text)
                .with_context(|| format!("Invalid request JSON in {:?}", path))?;
            if request.device_id.is_empty() {
                request.device_id = args.device.clone();
            }
            if request.codec.is_empty() {
                request.codec = args.codec.clone();
            }
            Ok(request)
        }
        None => Ok(StartRecordingRequest::new(
            format!("{}-{}", args.device, std::process::id()),
            args.device.clone(),
        )
        .codec(args.codec.clone())),
    }
}

/// Re-read a finished file and walk its EBML structure.
fn verify(path: &std::path::Path) -> Result<ProbeInfo> {
    let data = std::fs::read(path).with_context(|| format!("Failed to read {:?}", path))?;
    Ok(probe(&data)?)
}

fn save_snapshot(dir: &std::path::Path, index: u64, frame: &Frame) -> Result<PathBuf> {
    std::fs::create_dir_all(dir)?;
    let path = dir.join(format!("snapshot_{:06}.png", index));
    std::fs::write(&path, frame.data()).with_context(|| format!("Failed to write {:?}", path))?;
    Ok(path)
}

// ---------------------------------------------------------------------------
// Main
// ---------------------------------------------------------------------------

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("droidrec=info".parse()?)
                .add_directive("recorder=info".parse()?)
                .add_directive("warn".parse()?),
        )
        .init();

    let argv: Vec<String> = std::env::args().collect();
    let args = match parse_args(&argv) {
        Ok(args) => args,
        Err(e) => {
            eprintln!("Error: {}", e);
            eprintln!();
            print_usage();
            std::process::exit(1);
        }
    };
    let cancel = CancellationToken::new();

    // Ctrl+C handler
    let cancel_clone = cancel.clone();
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        tracing::info!("Ctrl+C received, stopping...");
        cancel_clone.cancel();
    });

    // Duration timer
    if let Some(secs) = args.duration_secs {
        let cancel_clone = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(secs)).await;
            tracing::info!("Duration reached ({}s), stopping...", secs);
            cancel_clone.cancel();
        });
    }

    println!();
    println!("========================================");
    println!("Device Recorder");
    println!("========================================");
    println!("Device:     {}", args.device);
    println!("Backend:    {:?}{}", args.backend, if args.raw { " (raw)" } else { "" });
    println!("Video:      max {} px @ {} fps, {} bps", args.max_size, args.fps, args.bitrate);
    println!("Codec:      {}", args.codec);
    println!("Output dir: {}", args.output_dir.display());
    if let Some(d) = args.duration_secs {
        println!("Duration:   {}s", d);
    } else {
        println!("Duration:   until Ctrl+C");
    }
    println!("========================================");
    println!();

    let reconnect = ReconnectPolicy::default()
        .max_attempts(args.max_reconnects)
        .observer(|ok, attempt| {
            if ok {
                tracing::info!("Reconnected after {} attempt(s)", attempt);
            } else {
                tracing::warn!("Reconnection attempt {} failed", attempt);
            }
        });
    let options = CaptureOptions::new(args.device.clone())
        .max_size(args.max_size)
        .bitrate(args.bitrate)
        .max_fps(args.fps)
        .local_port(args.port)
        .server_path(args.server.clone())
        .mode(if args.raw { StreamMode::Raw } else { StreamMode::Framed })
        .reconnect(reconnect);

    let bridge = DeviceBridge::adb(&args.adb, &args.device);
    let pool = Arc::new(BufferPool::new());
    let mut backend = CaptureBackend::start(args.backend, options, bridge, Arc::clone(&pool))
        .await
        .with_context(|| format!("Failed to start {:?} capture", args.backend))?;
    let mut frames = backend
        .take_frames()
        .context("frame queue already taken")?;
    tracing::info!("Capture started ({})", backend.name());

    if let Some(quality) = args.quality {
        match backend.bitrate_control() {
            Some(control) => match control.set_quality(quality).await {
                Ok(bps) => tracing::info!("Quality {} -> {} bps", quality, bps),
                Err(e) => tracing::warn!("Could not set quality: {:#}", e),
            },
            None => tracing::warn!("{} backend has no bitrate control", backend.name()),
        }
    }

    let coordinator = RecordingCoordinator::new(RecorderConfig::new(args.output_dir.clone()));
    let mut request = Some(load_request(&args)?);
    let needs_parameter_sets = backend.frame_format() == FrameFormat::H264
        && request.as_ref().is_some_and(|r| r.codec.eq_ignore_ascii_case("H264"));

    let mut recording: Option<Recording> = None;
    let mut timeline = Timeline::default();
    let mut written = 0u64;
    let mut skipped = 0u64;
    let started = Instant::now();

    // -----------------------------------------------------------------------
    // Main loop
    // -----------------------------------------------------------------------
    tracing::info!("Recording...");
    loop {
        let frame = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                tracing::info!("Stopping recording...");
                break;
            }
            frame = frames.recv() => frame,
        };
        let Some(frame) = frame else {
            tracing::info!("Capture ended");
            break;
        };

        if frame.format == FrameFormat::Png {
            let path = save_snapshot(&args.output_dir, written, &frame)?;
            tracing::debug!("Saved {:?}", path);
            written += 1;
            frame.release();
            continue;
        }

        // Parameter sets are cached by the backend and go into CodecPrivate
        if frame.config {
            frame.release();
            continue;
        }

        if recording.is_none() {
            let (sps, pps) = backend.parameter_sets();
            let ready = !needs_parameter_sets || (sps.is_some() && pps.is_some() && frame.keyframe);
            if !ready {
                skipped += 1;
                frame.release();
                continue;
            }
            let Some(req) = request.take() else {
                bail!("recording request already used");
            };
            let req = req.or_parameter_sets(sps.as_deref(), pps.as_deref());
            let (width, height) = match backend.resolution() {
                (0, _) | (_, 0) => (frame.width, frame.height),
                size => size,
            };
            let started_rec = coordinator.start(req, width, height)?;
            if skipped > 0 {
                tracing::info!("Skipped {} frames while waiting for SPS/PPS", skipped);
            }
            recording = Some(started_rec);
        }

        if let Some(rec) = &recording {
            let ts = timeline.timestamp(&frame);
            if let Err(e) = coordinator.write_frame(&rec.id, frame.data(), ts, frame.keyframe) {
                tracing::error!("{:#}", e);
                frame.release();
                break;
            }
            written += 1;
            if written.is_multiple_of(300) {
                let stats = backend.stats();
                tracing::info!(
                    "{} frames, {:.1} fps, {} dropped, {}s elapsed",
                    written,
                    stats.current_fps,
                    stats.frames_dropped,
                    started.elapsed().as_secs()
                );
            }
        }
        frame.release();
    }

    // -----------------------------------------------------------------------
    // Shutdown
    // -----------------------------------------------------------------------
    let finished = match &recording {
        Some(rec) => match coordinator.stop(&rec.id).await {
            Ok(done) => Some(done),
            // The max duration from a request file may already have closed it
            Err(_) => coordinator.get(&rec.id),
        },
        None => None,
    };
    if let Err(e) = backend.stop().await {
        tracing::warn!("Capture stop: {:#}", e);
    }

    let verified = match &finished {
        Some(done) => match verify(&done.file_path) {
            Ok(info) => {
                tracing::info!(
                    "Verified {:?}: {} clusters, {} blocks, {} keyframes, {}x{} {}",
                    done.file_path,
                    info.clusters,
                    info.blocks,
                    info.keyframes,
                    info.width,
                    info.height,
                    info.codec_id
                );
                serde_json::json!({
                    "clusters": info.clusters,
                    "blocks": info.blocks,
                    "keyframes": info.keyframes,
                    "codec_id": info.codec_id,
                })
            }
            Err(e) => {
                tracing::warn!("Verification of {:?} failed: {:#}", done.file_path, e);
                serde_json::json!({ "error": e.to_string() })
            }
        },
        None => serde_json::Value::Null,
    };

    let pool_stats = pool.stats();
    let summary = serde_json::json!({
        "backend": backend.name(),
        "frames_written": written,
        "elapsed_secs": started.elapsed().as_secs_f64(),
        "recording": finished,
        "capture": backend.stats(),
        "verified": verified,
        "pool": {
            "allocations": pool_stats.allocations,
            "reuses": pool_stats.reuses,
            "reuse_rate": pool_stats.reuse_rate(),
        },
    });
    println!("{}", serde_json::to_string_pretty(&summary)?);

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn argv(list: &[&str]) -> Vec<String> {
        std::iter::once("recorder")
            .chain(list.iter().copied())
            .map(String::from)
            .collect()
    }

    #[test]
    fn test_parse_args_defaults() {
        let args = parse_args(&argv(&["--device", "emulator-5554"])).unwrap();
        assert_eq!(args.device, "emulator-5554");
        assert_eq!(args.port, 27183);
        assert_eq!(args.backend, BackendKind::Scrcpy);
        assert_eq!(args.codec, "H264");
        assert!(!args.raw);
        assert_eq!(args.max_reconnects, 5);
    }

    #[test]
    fn test_parse_args_flags() {
        let args = parse_args(&argv(&[
            "--device", "R58M", "--raw", "--backend", "screenrecord", "--bitrate", "2000000",
            "--duration", "10", "--quality", "80", "--codec", "vp8", "--max-reconnects", "0",
        ]))
        .unwrap();
        assert!(args.raw);
        assert_eq!(args.backend, BackendKind::ScreenRecord);
        assert_eq!(args.bitrate, 2_000_000);
        assert_eq!(args.duration_secs, Some(10));
        assert_eq!(args.quality, Some(80));
        assert_eq!(args.codec, "VP8");
        assert_eq!(args.max_reconnects, 0);
    }

    #[test]
    fn test_parse_args_errors() {
        assert!(parse_args(&argv(&[])).is_err());
        assert!(parse_args(&argv(&["--device"])).is_err());
        assert!(parse_args(&argv(&["--device", "x", "--port", "abc"])).is_err());
        assert!(parse_args(&argv(&["--device", "x", "--backend", "vnc"])).is_err());
        assert!(parse_args(&argv(&["--device", "x", "--bogus"])).is_err());
    }

    #[test]
    fn test_timeline_relative_to_first_frame() {
        let mut timeline = Timeline::default();
        let mut frame = Frame::shared(bytes::Bytes::from_static(&[0]), FrameFormat::H264);
        frame.pts = Some(1_000_000);
        assert_eq!(timeline.timestamp(&frame), Duration::ZERO);
        frame.pts = Some(1_033_333);
        assert_eq!(timeline.timestamp(&frame), Duration::from_micros(33_333));

        let mut timeline = Timeline::default();
        let first = Frame::shared(bytes::Bytes::from_static(&[0]), FrameFormat::H264);
        let mut later = Frame::shared(bytes::Bytes::from_static(&[0]), FrameFormat::H264);
        later.captured_at = first.captured_at + Duration::from_millis(40);
        assert_eq!(timeline.timestamp(&first), Duration::ZERO);
        assert_eq!(timeline.timestamp(&later), Duration::from_millis(40));
    }
}
