//! Capture and playback devices.
//!
//! Capture sources produce blocks of floating-point samples in [-1.0, 1.0]
//! at 24kHz mono. Playback sinks receive decoded PCM16 frames as soon as they
//! arrive; sinks decide how to render overlapping audio.

use std::fs::File;
use std::io::BufWriter;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::audio::{AudioFrame, SAMPLE_RATE};
use crate::error::{RealtimeError, Result};

/// Capture blocks buffered between the device and the bridge.
pub const CAPTURE_QUEUE: usize = 64;

/// A microphone-like source of samples.
#[async_trait]
pub trait CaptureSource: Send + Sync {
    /// Start capturing. Blocks arrive on the returned receiver until
    /// [`CaptureSource::stop`] is called or the source runs dry.
    async fn start(&self) -> Result<mpsc::Receiver<Vec<f32>>>;

    /// Stop capturing and release the device. Idempotent.
    fn stop(&self);

    /// True when the source holds no device.
    fn is_released(&self) -> bool;
}

/// A speaker-like sink for decoded inbound audio.
pub trait PlaybackSink: Send + Sync {
    /// Render a frame.
    fn play(&self, frame: &AudioFrame) -> Result<()>;

    /// Flush and release the sink. Idempotent.
    fn close(&self) -> Result<()>;

    /// True once closed.
    fn is_released(&self) -> bool;
}

/// Opens capture and playback for a call.
#[async_trait]
pub trait MediaDevices: Send + Sync {
    /// Acquire the capture device.
    async fn open_capture(&self) -> Result<Arc<dyn CaptureSource>>;

    /// Acquire the playback device.
    async fn open_playback(&self) -> Result<Arc<dyn PlaybackSink>>;
}

/// Hands out the same pre-built devices to every call.
#[derive(Clone)]
pub struct FixedDevices {
    capture: Arc<dyn CaptureSource>,
    playback: Arc<dyn PlaybackSink>,
}

impl FixedDevices {
    /// Wrap a capture source and a playback sink.
    pub fn new(capture: Arc<dyn CaptureSource>, playback: Arc<dyn PlaybackSink>) -> Self {
        Self { capture, playback }
    }
}

#[async_trait]
impl MediaDevices for FixedDevices {
    async fn open_capture(&self) -> Result<Arc<dyn CaptureSource>> {
        Ok(Arc::clone(&self.capture))
    }

    async fn open_playback(&self) -> Result<Arc<dyn PlaybackSink>> {
        Ok(Arc::clone(&self.playback))
    }
}

// ── Channel-fed capture ─────────────────────────────────────────────────

type SharedSender = Arc<Mutex<Option<mpsc::Sender<Vec<f32>>>>>;

/// Capture fed programmatically through a [`CaptureFeeder`].
pub struct ChannelCapture {
    sender: SharedSender,
    capacity: usize,
}

/// Pushes sample blocks into a running [`ChannelCapture`].
#[derive(Clone)]
pub struct CaptureFeeder {
    sender: SharedSender,
}

impl ChannelCapture {
    /// Create a capture and its feeder.
    pub fn new(capacity: usize) -> (Self, CaptureFeeder) {
        let sender: SharedSender = Arc::new(Mutex::new(None));
        let capture = Self { sender: Arc::clone(&sender), capacity: capacity.max(1) };
        (capture, CaptureFeeder { sender })
    }
}

#[async_trait]
impl CaptureSource for ChannelCapture {
    async fn start(&self) -> Result<mpsc::Receiver<Vec<f32>>> {
        let mut slot = self.sender.lock();
        if slot.is_some() {
            return Err(RealtimeError::media("capture already started"));
        }
        let (tx, rx) = mpsc::channel(self.capacity);
        *slot = Some(tx);
        Ok(rx)
    }

    fn stop(&self) {
        self.sender.lock().take();
    }

    fn is_released(&self) -> bool {
        self.sender.lock().is_none()
    }
}

impl CaptureFeeder {
    /// Offer a block. Returns false when capture is stopped or the queue is
    /// full; the block is dropped in both cases.
    pub fn feed(&self, samples: Vec<f32>) -> bool {
        match self.sender.lock().as_ref() {
            Some(tx) => tx.try_send(samples).is_ok(),
            None => false,
        }
    }

    /// Whether the capture is currently running.
    pub fn is_active(&self) -> bool {
        self.sender.lock().is_some()
    }
}

// ── WAV capture ─────────────────────────────────────────────────────────

/// Replays a 24kHz mono WAV file in real time.
pub struct WavCapture {
    path: PathBuf,
    block: Duration,
    running: Mutex<Option<CancellationToken>>,
}

impl WavCapture {
    /// Capture from `path` in 100ms blocks.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into(), block: Duration::from_millis(100), running: Mutex::new(None) }
    }

    /// Change the block duration.
    pub fn with_block(mut self, block: Duration) -> Self {
        self.block = block.max(Duration::from_millis(1));
        self
    }
}

/// Read a WAV file into floating-point samples. The file must be 24kHz mono.
pub fn read_wav_samples(path: &Path) -> Result<Vec<f32>> {
    let mut reader = hound::WavReader::open(path)
        .map_err(|e| RealtimeError::media(format!("cannot open {}: {e}", path.display())))?;
    let spec = reader.spec();
    if spec.sample_rate != SAMPLE_RATE || spec.channels != 1 {
        return Err(RealtimeError::media(format!(
            "{} is {} Hz with {} channel(s); expected {SAMPLE_RATE} Hz mono",
            path.display(),
            spec.sample_rate,
            spec.channels
        )));
    }

    let samples = match spec.sample_format {
        hound::SampleFormat::Float => {
            reader.samples::<f32>().collect::<std::result::Result<Vec<_>, _>>()?
        }
        hound::SampleFormat::Int => {
            let scale = (1i64 << (spec.bits_per_sample.saturating_sub(1))) as f32;
            reader
                .samples::<i32>()
                .map(|s| s.map(|v| v as f32 / scale))
                .collect::<std::result::Result<Vec<_>, _>>()?
        }
    };
    Ok(samples)
}

#[async_trait]
impl CaptureSource for WavCapture {
    async fn start(&self) -> Result<mpsc::Receiver<Vec<f32>>> {
        let path = self.path.clone();
        let samples = tokio::task::spawn_blocking(move || read_wav_samples(&path))
            .await
            .map_err(|e| RealtimeError::media(format!("capture reader failed: {e}")))??;

        let token = CancellationToken::new();
        {
            let mut running = self.running.lock();
            if running.as_ref().is_some_and(|t| !t.is_cancelled()) {
                return Err(RealtimeError::media("capture already started"));
            }
            *running = Some(token.clone());
        }

        let (tx, rx) = mpsc::channel(CAPTURE_QUEUE);
        let block_len = ((SAMPLE_RATE as u128 * self.block.as_millis()) / 1000).max(1) as usize;
        let mut ticker = tokio::time::interval(self.block);
        tracing::debug!(path = %self.path.display(), samples = samples.len(), "wav capture started");

        tokio::spawn(async move {
            for block in samples.chunks(block_len) {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {}
                }
                if tx.try_send(block.to_vec()).is_err() && tx.is_closed() {
                    break;
                }
            }
            token.cancel();
        });
        Ok(rx)
    }

    fn stop(&self) {
        if let Some(token) = self.running.lock().take() {
            token.cancel();
        }
    }

    fn is_released(&self) -> bool {
        self.running.lock().as_ref().is_none_or(CancellationToken::is_cancelled)
    }
}

// ── Playback sinks ──────────────────────────────────────────────────────

/// Writes inbound audio to a 24kHz mono PCM16 WAV file.
pub struct WavRecorder {
    path: PathBuf,
    writer: Mutex<Option<hound::WavWriter<BufWriter<File>>>>,
    released: AtomicBool,
}

impl WavRecorder {
    /// Create the output file.
    pub fn create(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let spec = hound::WavSpec {
            channels: 1,
            sample_rate: SAMPLE_RATE,
            bits_per_sample: 16,
            sample_format: hound::SampleFormat::Int,
        };
        let writer = hound::WavWriter::create(&path, spec)?;
        Ok(Self { path, writer: Mutex::new(Some(writer)), released: AtomicBool::new(false) })
    }

    /// Output path.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl PlaybackSink for WavRecorder {
    fn play(&self, frame: &AudioFrame) -> Result<()> {
        let mut guard = self.writer.lock();
        let writer =
            guard.as_mut().ok_or_else(|| RealtimeError::media("playback already closed"))?;
        for sample in &frame.samples {
            writer.write_sample(*sample)?;
        }
        Ok(())
    }

    fn close(&self) -> Result<()> {
        self.released.store(true, Ordering::SeqCst);
        if let Some(writer) = self.writer.lock().take() {
            writer.finalize()?;
        }
        Ok(())
    }

    fn is_released(&self) -> bool {
        self.released.load(Ordering::SeqCst)
    }
}

/// Keeps inbound audio in memory.
#[derive(Debug, Default)]
pub struct MemoryPlayback {
    samples: Mutex<Vec<i16>>,
    frames: AtomicUsize,
    released: AtomicBool,
}

impl MemoryPlayback {
    /// Create an empty sink.
    pub fn new() -> Self {
        Self::default()
    }

    /// Everything played so far.
    pub fn samples(&self) -> Vec<i16> {
        self.samples.lock().clone()
    }

    /// Number of frames played.
    pub fn frames(&self) -> usize {
        self.frames.load(Ordering::SeqCst)
    }
}

impl PlaybackSink for MemoryPlayback {
    fn play(&self, frame: &AudioFrame) -> Result<()> {
        if self.is_released() {
            return Err(RealtimeError::media("playback already closed"));
        }
        self.samples.lock().extend_from_slice(&frame.samples);
        self.frames.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn close(&self) -> Result<()> {
        self.released.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn is_released(&self) -> bool {
        self.released.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_wav(path: &Path, sample_rate: u32, channels: u16, samples: &[i16]) {
        let spec = hound::WavSpec {
            channels,
            sample_rate,
            bits_per_sample: 16,
            sample_format: hound::SampleFormat::Int,
        };
        let mut writer = hound::WavWriter::create(path, spec).unwrap();
        for s in samples {
            writer.write_sample(*s).unwrap();
        }
        writer.finalize().unwrap();
    }

    #[tokio::test]
    async fn test_channel_capture_lifecycle() {
        let (capture, feeder) = ChannelCapture::new(4);
        assert!(capture.is_released());
        assert!(!feeder.feed(vec![0.0; 8]));

        let mut rx = capture.start().await.unwrap();
        assert!(!capture.is_released());
        assert!(capture.start().await.is_err());
        assert!(feeder.feed(vec![0.25; 8]));
        assert_eq!(rx.recv().await.unwrap(), vec![0.25; 8]);

        capture.stop();
        assert!(capture.is_released());
        assert!(rx.recv().await.is_none());
        assert!(!feeder.feed(vec![0.0; 8]));
    }

    #[tokio::test]
    async fn test_wav_capture_rejects_wrong_rate() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("in.wav");
        write_wav(&path, 16_000, 1, &[0; 160]);

        let err = WavCapture::new(&path).start().await.unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::Media);
    }

    #[tokio::test]
    async fn test_wav_capture_streams_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("in.wav");
        write_wav(&path, SAMPLE_RATE, 1, &[16384; 480]);

        let capture = WavCapture::new(&path).with_block(Duration::from_millis(10));
        let mut rx = capture.start().await.unwrap();
        let mut total = Vec::new();
        while let Some(block) = rx.recv().await {
            assert!(block.len() <= 240);
            total.extend(block);
        }
        assert_eq!(total.len(), 480);
        assert!(total.iter().all(|s| (*s - 0.5).abs() < 1e-6));
        assert!(capture.is_released());
    }

    #[test]
    fn test_wav_recorder_writes_frames() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.wav");
        let recorder = WavRecorder::create(&path).unwrap();
        recorder.play(&AudioFrame::new(vec![1, 2, 3])).unwrap();
        recorder.play(&AudioFrame::new(vec![4])).unwrap();
        recorder.close().unwrap();
        assert!(recorder.is_released());
        assert!(recorder.play(&AudioFrame::new(vec![5])).is_err());

        let reader = hound::WavReader::open(&path).unwrap();
        let samples: Vec<i16> = reader.into_samples().map(|s| s.unwrap()).collect();
        assert_eq!(samples, vec![1, 2, 3, 4]);
    }

    #[test]
    fn test_memory_playback_appends_in_order() {
        let sink = MemoryPlayback::new();
        sink.play(&AudioFrame::new(vec![1, 2])).unwrap();
        sink.play(&AudioFrame::new(vec![3])).unwrap();
        assert_eq!(sink.samples(), vec![1, 2, 3]);
        assert_eq!(sink.frames(), 2);
        sink.close().unwrap();
        sink.close().unwrap();
        assert!(sink.is_released());
    }
}
