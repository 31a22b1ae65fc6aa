//! Loopback audio capture.
//!
//! # Design constraints
//!
//! The cpal input callback runs on an OS audio thread at elevated priority.
//! It **must not**:
//! - Allocate heap memory (beyond a one-time scratch grow)
//! - Block on a mutex or condvar
//! - Perform I/O
//!
//! The callback therefore only downmixes to mono and writes into an SPSC
//! ring buffer whose `push_slice` is lock-free.
//!
//! # Threading
//!
//! `cpal::Stream` is `!Send` on most platforms (COM on Windows, CoreAudio on
//! macOS). All binding, health supervision, and teardown happen on one
//! dedicated capture thread that owns the stream for its whole life; the
//! per-session `active` flag is flipped off before the stream is dropped so
//! the callback and teardown never touch the stream concurrently.
//!
//! # Hot re-bind
//!
//! The supervisor wakes every `AUDIO_DEVICE_CHECK_INTERVAL` and re-binds when
//! the default device moved (and no device is pinned), the stream reported an
//! error, or no frame has been produced for the dead-stream timeout. A fresh
//! bind gets a grace period before silence counts against it. Frame indices
//! restart at 0 on every re-bind; downstream treats that as a new capture
//! session.

pub mod device;
pub mod frame;
pub mod resample;

use std::sync::{
    atomic::{AtomicBool, AtomicU64, Ordering},
    Arc,
};
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};
use tracing::{debug, info, warn};

use crate::config::AudioConfig;
use crate::error::{ParoloError, Result};
use crate::util::backoff::Backoff;
use self::frame::{FrameQueue, FRAME_QUEUE_CAPACITY};

/// No frames for this long (past the bind grace) marks the stream dead.
const DEAD_STREAM_TIMEOUT: Duration = Duration::from_secs(5);
/// A new bind is not judged on silence until this much time has passed.
const BIND_GRACE: Duration = Duration::from_millis(1500);
/// How often the capture thread drains the ring between supervisor ticks.
const DRAIN_INTERVAL: Duration = Duration::from_millis(50);
/// Device-open retry floor and ceiling.
const OPEN_RETRY_FLOOR: Duration = Duration::from_millis(500);
const OPEN_RETRY_CAP: Duration = Duration::from_secs(5);

/// Capture counters exposed for diagnostics.
#[derive(Default)]
pub struct SourceStats {
    pub sessions: AtomicU64,
    pub frames_emitted: AtomicU64,
    pub stream_errors: AtomicU64,
}

/// Owns the capture thread and the frame queue it feeds.
pub struct AudioSource {
    config: AudioConfig,
    frames: FrameQueue,
    running: Arc<AtomicBool>,
    stats: Arc<SourceStats>,
    stop_tx: Option<Sender<()>>,
    handle: Option<std::thread::JoinHandle<()>>,
}

impl AudioSource {
    pub fn new(config: AudioConfig) -> Self {
        Self {
            config,
            frames: FrameQueue::new(FRAME_QUEUE_CAPACITY),
            running: Arc::new(AtomicBool::new(false)),
            stats: Arc::new(SourceStats::default()),
            stop_tx: None,
            handle: None,
        }
    }

    /// Handle for the consumer side of the frame stream.
    pub fn frames(&self) -> FrameQueue {
        self.frames.clone()
    }

    pub fn stats(&self) -> Arc<SourceStats> {
        Arc::clone(&self.stats)
    }

    /// Spawn the capture thread. Device-open failures are not fatal: the
    /// thread retries with backoff until `stop()`.
    #[cfg(feature = "audio-cpal")]
    pub fn start(&mut self) -> Result<()> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Err(ParoloError::AudioStream("capture already running".into()));
        }

        let (stop_tx, stop_rx) = crossbeam_channel::bounded::<()>(1);
        let config = self.config.clone();
        let frames = self.frames.clone();
        let running = Arc::clone(&self.running);
        let stats = Arc::clone(&self.stats);

        let handle = std::thread::Builder::new()
            .name("parolo-capture".into())
            .spawn(move || capture_loop(config, frames, running, stop_rx, stats))
            .map_err(|e| ParoloError::AudioStream(format!("spawn capture thread: {e}")))?;

        self.stop_tx = Some(stop_tx);
        self.handle = Some(handle);
        Ok(())
    }

    #[cfg(not(feature = "audio-cpal"))]
    pub fn start(&mut self) -> Result<()> {
        Err(ParoloError::AudioStream(
            "compiled without the audio-cpal feature".into(),
        ))
    }

    /// Stop capture: release the device, close the frame queue, join the
    /// thread. Idempotent.
    pub fn stop(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(tx) = self.stop_tx.take() {
            let _ = tx.send(());
        }
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                warn!("capture thread panicked during shutdown");
            }
        }
        self.frames.close();
    }
}

impl Drop for AudioSource {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Why the supervisor decided to tear a stream down.
///
/// Pulled out as a pure function so the policy is testable without a device.
fn rebind_reason(
    pinned: bool,
    default_changed: bool,
    stream_failed: bool,
    bound_age: Duration,
    last_frame_age: Duration,
) -> Option<&'static str> {
    if stream_failed {
        return Some("stream reported an error");
    }
    if !pinned && default_changed {
        return Some("default input device changed");
    }
    if bound_age >= BIND_GRACE && last_frame_age >= DEAD_STREAM_TIMEOUT {
        return Some("no frames within dead-stream timeout");
    }
    None
}

/// Returns `true` when the loop should exit.
fn wait_or_stop(stop_rx: &Receiver<()>, timeout: Duration) -> bool {
    match stop_rx.recv_timeout(timeout) {
        Ok(()) | Err(RecvTimeoutError::Disconnected) => true,
        Err(RecvTimeoutError::Timeout) => false,
    }
}

#[cfg(feature = "audio-cpal")]
fn capture_loop(
    config: AudioConfig,
    frames: FrameQueue,
    running: Arc<AtomicBool>,
    stop_rx: Receiver<()>,
    stats: Arc<SourceStats>,
) {
    let mut backoff = Backoff::new(OPEN_RETRY_FLOOR, OPEN_RETRY_CAP);
    let mut bound: Option<bind::BoundStream> = None;

    'outer: while running.load(Ordering::Relaxed) {
        if bound.is_none() {
            match bind::BoundStream::bind(&config) {
                Ok(stream) => {
                    stats.sessions.fetch_add(1, Ordering::Relaxed);
                    backoff.reset();
                    info!(
                        device = stream.device_name.as_str(),
                        index = stream.device_index,
                        capture_rate = stream.capture_rate,
                        "audio capture bound"
                    );
                    bound = Some(stream);
                }
                Err(e) => {
                    let delay = backoff.next_delay();
                    warn!(error = %e, retry_in_ms = delay.as_millis() as u64, "audio device open failed");
                    if wait_or_stop(&stop_rx, delay) {
                        break 'outer;
                    }
                    continue;
                }
            }
        }

        // Drain frequently between supervisor ticks so the ring stays shallow.
        let tick_deadline = Instant::now() + config.device_check_interval;
        while Instant::now() < tick_deadline {
            if wait_or_stop(&stop_rx, DRAIN_INTERVAL) {
                break 'outer;
            }
            if let Some(stream) = bound.as_mut() {
                stream.drain(&config, &frames, &stats);
            }
        }

        let reason = bound.as_ref().and_then(|stream| {
            rebind_reason(
                config.device_index.is_some() || config.device_name.is_some(),
                stream.default_device_moved(),
                stream.failed(),
                stream.bound_at.elapsed(),
                stream.last_frame_at.elapsed(),
            )
        });
        if let Some(reason) = reason {
            if bound.as_ref().is_some_and(|s| s.failed()) {
                stats.stream_errors.fetch_add(1, Ordering::Relaxed);
            }
            warn!(reason, "tearing down audio stream for re-bind");
            if let Some(stream) = bound.take() {
                stream.unbind();
            }
        }
    }

    if let Some(stream) = bound.take() {
        stream.unbind();
    }
    frames.close();
    info!(
        sessions = stats.sessions.load(Ordering::Relaxed),
        frames = stats.frames_emitted.load(Ordering::Relaxed),
        dropped = frames.dropped(),
        "audio capture stopped"
    );
}

#[cfg(feature = "audio-cpal")]
mod bind {
    use super::*;

    use cpal::traits::{DeviceTrait, StreamTrait};
    use cpal::{SampleFormat, SampleRate, StreamConfig};
    use ringbuf::{
        traits::{Consumer, Producer, Split},
        HeapCons, HeapProd, HeapRb,
    };

    use crate::audio::frame::{f32_to_pcm16le, AudioFrame};
    use crate::audio::resample::RateConverter;

    /// Ring capacity: 2^18 f32 samples ≈ 5.5 s at 48 kHz — comfortable slack
    /// between 50 ms drains.
    const RING_CAPACITY: usize = 1 << 18;
    /// Samples pulled from the ring per drain iteration.
    const DRAIN_CHUNK: usize = 4096;

    /// One bound capture session. Frame indices start at 0 here and die with it.
    pub(super) struct BoundStream {
        /// Kept alive so the stream is not dropped prematurely.
        _stream: cpal::Stream,
        /// Callback no-ops once this flips; flipped before the stream drops.
        active: Arc<AtomicBool>,
        /// Set by the cpal error callback.
        error_flag: Arc<AtomicBool>,
        consumer: HeapCons<f32>,
        resampler: RateConverter,
        scratch: Vec<f32>,
        pending: Vec<f32>,
        frame_index: u64,
        pub device_name: String,
        pub device_index: usize,
        pub capture_rate: u32,
        pub bound_at: Instant,
        pub last_frame_at: Instant,
    }

    impl BoundStream {
        /// Bind the preferred device, falling back across the enumeration in
        /// ascending index order when it cannot be opened.
        pub fn bind(config: &AudioConfig) -> crate::error::Result<Self> {
            let (preferred_idx, name, device) = device::resolve_device(config)?;
            match Self::open(config, preferred_idx, name.clone(), &device) {
                Ok(stream) => Ok(stream),
                Err(first_err) => {
                    warn!(device = name.as_str(), error = %first_err, "preferred device failed, trying others");
                    Self::open_any_other(config, preferred_idx).ok_or(first_err)
                }
            }
        }

        fn open_any_other(config: &AudioConfig, skip_idx: usize) -> Option<Self> {
            use cpal::traits::HostTrait;
            let host = cpal::default_host();
            let devices = host.input_devices().ok()?;
            for (idx, dev) in devices.enumerate() {
                if idx == skip_idx {
                    continue;
                }
                let name = dev
                    .name()
                    .unwrap_or_else(|_| format!("Input Device {}", idx + 1));
                match Self::open(config, idx, name.clone(), &dev) {
                    Ok(stream) => return Some(stream),
                    Err(e) => debug!(device = name.as_str(), error = %e, "fallback device failed"),
                }
            }
            None
        }

        fn open(
            config: &AudioConfig,
            device_index: usize,
            device_name: String,
            device: &cpal::Device,
        ) -> crate::error::Result<Self> {
            let supported = device
                .default_input_config()
                .map_err(|e| ParoloError::AudioDevice(e.to_string()))?;
            let native_rate = supported.sample_rate().0;
            let channels = supported.channels();
            let format = supported.sample_format();

            let (producer, consumer) = HeapRb::<f32>::new(RING_CAPACITY).split();
            let active = Arc::new(AtomicBool::new(true));
            let error_flag = Arc::new(AtomicBool::new(false));

            // Prefer the configured device rate; fall back to the device's
            // native default when the driver rejects it. Each attempt gets a
            // fresh ring so producer and consumer stay paired.
            let mut capture_rate = config.device_sample_rate;
            let first = Self::build_stream(
                device,
                channels,
                capture_rate,
                format,
                producer,
                Arc::clone(&active),
                Arc::clone(&error_flag),
            );
            let (stream, consumer) = match first {
                Ok(stream) => (stream, consumer),
                Err(_) if capture_rate != native_rate => {
                    capture_rate = native_rate;
                    let (producer, consumer) = HeapRb::<f32>::new(RING_CAPACITY).split();
                    let stream = Self::build_stream(
                        device,
                        channels,
                        native_rate,
                        format,
                        producer,
                        Arc::clone(&active),
                        Arc::clone(&error_flag),
                    )?;
                    (stream, consumer)
                }
                Err(e) => return Err(e),
            };

            stream
                .play()
                .map_err(|e| ParoloError::AudioStream(e.to_string()))?;

            let resampler =
                RateConverter::new(capture_rate, config.sample_rate, DRAIN_CHUNK.min(960))?;

            let now = Instant::now();
            Ok(Self {
                _stream: stream,
                active,
                error_flag,
                consumer,
                resampler,
                scratch: vec![0f32; DRAIN_CHUNK],
                pending: Vec::with_capacity(config.samples_per_frame() * 2),
                frame_index: 0,
                device_name,
                device_index,
                capture_rate,
                bound_at: now,
                last_frame_at: now,
            })
        }

        #[allow(clippy::too_many_arguments)]
        fn build_stream(
            device: &cpal::Device,
            channels: u16,
            sample_rate: u32,
            format: SampleFormat,
            mut producer: HeapProd<f32>,
            active: Arc<AtomicBool>,
            error_flag: Arc<AtomicBool>,
        ) -> crate::error::Result<cpal::Stream> {
            let stream_config = StreamConfig {
                channels,
                sample_rate: SampleRate(sample_rate),
                buffer_size: cpal::BufferSize::Default,
            };

            let err_flag = Arc::clone(&error_flag);
            let on_error = move |err: cpal::StreamError| {
                warn!("audio stream error: {err}");
                err_flag.store(true, Ordering::Release);
            };

            let ch = channels as usize;
            let stream = match format {
                SampleFormat::F32 => {
                    let mut mix_buf: Vec<f32> = Vec::new();
                    device.build_input_stream(
                        &stream_config,
                        move |data: &[f32], _info| {
                            if !active.load(Ordering::Relaxed) {
                                return;
                            }
                            if ch == 1 {
                                producer.push_slice(data);
                                return;
                            }
                            let frames = data.len() / ch;
                            mix_buf.resize(frames, 0.0);
                            for f in 0..frames {
                                let mut sum = 0f32;
                                let base = f * ch;
                                for c in 0..ch {
                                    sum += data[base + c];
                                }
                                mix_buf[f] = sum / ch as f32;
                            }
                            producer.push_slice(&mix_buf);
                        },
                        on_error,
                        None,
                    )
                }
                SampleFormat::I16 => {
                    let mut mix_buf: Vec<f32> = Vec::new();
                    device.build_input_stream(
                        &stream_config,
                        move |data: &[i16], _info| {
                            if !active.load(Ordering::Relaxed) {
                                return;
                            }
                            let frames = data.len() / ch;
                            mix_buf.resize(frames, 0.0);
                            if ch == 1 {
                                for (idx, sample) in data.iter().take(frames).enumerate() {
                                    mix_buf[idx] = *sample as f32 / 32768.0;
                                }
                            } else {
                                for f in 0..frames {
                                    let mut sum = 0f32;
                                    let base = f * ch;
                                    for c in 0..ch {
                                        sum += data[base + c] as f32 / 32768.0;
                                    }
                                    mix_buf[f] = sum / ch as f32;
                                }
                            }
                            producer.push_slice(&mix_buf);
                        },
                        on_error,
                        None,
                    )
                }
                SampleFormat::U8 => {
                    let mut mix_buf: Vec<f32> = Vec::new();
                    device.build_input_stream(
                        &stream_config,
                        move |data: &[u8], _info| {
                            if !active.load(Ordering::Relaxed) {
                                return;
                            }
                            let frames = data.len() / ch;
                            mix_buf.resize(frames, 0.0);
                            if ch == 1 {
                                for (idx, sample) in data.iter().take(frames).enumerate() {
                                    mix_buf[idx] = (*sample as f32 - 128.0) / 128.0;
                                }
                            } else {
                                for f in 0..frames {
                                    let mut sum = 0f32;
                                    let base = f * ch;
                                    for c in 0..ch {
                                        sum += (data[base + c] as f32 - 128.0) / 128.0;
                                    }
                                    mix_buf[f] = sum / ch as f32;
                                }
                            }
                            producer.push_slice(&mix_buf);
                        },
                        on_error,
                        None,
                    )
                }
                fmt => {
                    return Err(ParoloError::AudioStream(format!(
                        "unsupported sample format: {fmt:?}"
                    )))
                }
            }
            .map_err(|e| ParoloError::AudioStream(e.to_string()))?;

            Ok(stream)
        }

        /// Pull everything out of the ring, resample, and emit full frames.
        pub fn drain(&mut self, config: &AudioConfig, frames: &FrameQueue, stats: &SourceStats) {
            let samples_per_frame = config.samples_per_frame();
            loop {
                let n = self.consumer.pop_slice(&mut self.scratch);
                if n == 0 {
                    break;
                }
                let resampled = self.resampler.process(&self.scratch[..n]);
                self.pending.extend_from_slice(&resampled);

                while self.pending.len() >= samples_per_frame {
                    let chunk: Vec<f32> = self.pending.drain(..samples_per_frame).collect();
                    let frame = AudioFrame {
                        pcm: f32_to_pcm16le(&chunk),
                        sample_rate: config.sample_rate,
                        channels: 1,
                        frame_index: self.frame_index,
                        captured_at: Instant::now(),
                    };
                    self.frame_index += 1;
                    self.last_frame_at = Instant::now();
                    stats.frames_emitted.fetch_add(1, Ordering::Relaxed);
                    frames.push(frame);
                }

                if n < self.scratch.len() {
                    break;
                }
            }
        }

        pub fn failed(&self) -> bool {
            self.error_flag.load(Ordering::Acquire)
        }

        /// Whether the platform default input differs from the bound device.
        pub fn default_device_moved(&self) -> bool {
            match device::default_input_device_name() {
                Some(name) => name != self.device_name,
                None => false,
            }
        }

        /// Quiesce the callback, then drop the stream on this thread.
        pub fn unbind(self) {
            self.active.store(false, Ordering::Release);
            // Stream drops here, releasing the device.
        }
    }
}
