use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::config::ToneConfig;
use crate::{EchoError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChannelLayout {
    Mono,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SampleEncoding {
    /// Signed 16-bit little-endian.
    Pcm16,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StreamMode {
    /// Data is pushed with successive writes while the device plays.
    Stream,
}

/// Parameters an audio output is opened with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AudioOutputSpec {
    pub sample_rate_hz: u32,
    pub channels: ChannelLayout,
    pub encoding: SampleEncoding,
    pub buffer_size_bytes: usize,
    pub mode: StreamMode,
}

impl AudioOutputSpec {
    /// Output matching the tones produced for `config`; the device buffer holds
    /// half a tone.
    pub fn for_tone(config: &ToneConfig) -> Self {
        Self {
            sample_rate_hz: config.sample_rate_hz,
            channels: ChannelLayout::Mono,
            encoding: SampleEncoding::Pcm16,
            buffer_size_bytes: config.num_samples(),
            mode: StreamMode::Stream,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum PlayState {
    #[default]
    Stopped,
    Playing,
}

/// Streaming PCM output.
pub trait AudioDevice: Send {
    fn spec(&self) -> AudioOutputSpec;
    fn play(&mut self) -> Result<()>;
    fn stop(&mut self) -> Result<()>;
    /// Queues PCM bytes for playback and returns how many were accepted.
    fn write(&mut self, pcm: &[u8]) -> Result<usize>;
    fn play_state(&self) -> PlayState;
    /// Frees the device. Called once, after which no other method is used.
    fn release(&mut self) {}
}

/// One accepted write.
#[derive(Debug, Clone, PartialEq)]
pub struct WriteRecord {
    pub bytes: Vec<u8>,
    pub state: PlayState,
}

/// Observable history of a [`MemoryDevice`], shared with tests and callers.
#[derive(Debug, Default)]
pub struct DeviceLog {
    writes: Mutex<Vec<WriteRecord>>,
    plays: AtomicU32,
    stops: AtomicU32,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
    released: Mutex<bool>,
}

impl DeviceLog {
    pub fn writes(&self) -> Vec<WriteRecord> {
        self.writes.lock().clone()
    }

    pub fn write_count(&self) -> usize {
        self.writes.lock().len()
    }

    pub fn last_write(&self) -> Option<WriteRecord> {
        self.writes.lock().last().cloned()
    }

    pub fn plays(&self) -> u32 {
        self.plays.load(Ordering::SeqCst)
    }

    pub fn stops(&self) -> u32 {
        self.stops.load(Ordering::SeqCst)
    }

    /// Highest number of writes ever observed running at the same time.
    pub fn max_concurrent_writes(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    pub fn is_released(&self) -> bool {
        *self.released.lock()
    }
}

/// In-memory output device that keeps every write.
#[derive(Debug)]
pub struct MemoryDevice {
    spec: AudioOutputSpec,
    state: PlayState,
    write_latency: Duration,
    failures_pending: u32,
    log: Arc<DeviceLog>,
}

impl MemoryDevice {
    pub fn open(spec: AudioOutputSpec) -> Self {
        Self {
            spec,
            state: PlayState::Stopped,
            write_latency: Duration::ZERO,
            failures_pending: 0,
            log: Arc::default(),
        }
    }

    /// Makes every write take at least `latency`.
    pub fn with_write_latency(mut self, latency: Duration) -> Self {
        self.write_latency = latency;
        self
    }

    /// Makes the next `count` writes fail.
    pub fn failing_writes(mut self, count: u32) -> Self {
        self.failures_pending = count;
        self
    }

    pub fn log(&self) -> Arc<DeviceLog> {
        self.log.clone()
    }
}

impl AudioDevice for MemoryDevice {
    fn spec(&self) -> AudioOutputSpec {
        self.spec
    }

    fn play(&mut self) -> Result<()> {
        self.state = PlayState::Playing;
        self.log.plays.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn stop(&mut self) -> Result<()> {
        self.state = PlayState::Stopped;
        self.log.stops.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn write(&mut self, pcm: &[u8]) -> Result<usize> {
        let concurrent = self.log.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.log.max_in_flight.fetch_max(concurrent, Ordering::SeqCst);

        if !self.write_latency.is_zero() {
            thread::sleep(self.write_latency);
        }

        let result = if self.failures_pending > 0 {
            self.failures_pending -= 1;
            Err(EchoError::AudioDevice("device busy".to_string()))
        } else {
            self.log.writes.lock().push(WriteRecord {
                bytes: pcm.to_vec(),
                state: self.state,
            });
            Ok(pcm.len())
        };

        self.log.in_flight.fetch_sub(1, Ordering::SeqCst);
        result
    }

    fn play_state(&self) -> PlayState {
        self.state
    }

    fn release(&mut self) {
        *self.log.released.lock() = true;
    }
}

/// Appends the PCM stream to a file, e.g. for playback with an external tool.
#[derive(Debug)]
pub struct RawPcmFileDevice {
    spec: AudioOutputSpec,
    state: PlayState,
    writer: Option<BufWriter<File>>,
}

impl RawPcmFileDevice {
    pub fn open(path: impl AsRef<Path>, spec: AudioOutputSpec) -> Result<Self> {
        let file = File::create(path.as_ref())?;
        tracing::info!(path = %path.as_ref().display(), sample_rate = spec.sample_rate_hz, "opened raw pcm output");
        Ok(Self {
            spec,
            state: PlayState::Stopped,
            writer: Some(BufWriter::new(file)),
        })
    }
}

impl AudioDevice for RawPcmFileDevice {
    fn spec(&self) -> AudioOutputSpec {
        self.spec
    }

    fn play(&mut self) -> Result<()> {
        self.state = PlayState::Playing;
        Ok(())
    }

    fn stop(&mut self) -> Result<()> {
        self.state = PlayState::Stopped;
        if let Some(writer) = self.writer.as_mut() {
            writer.flush()?;
        }
        Ok(())
    }

    fn write(&mut self, pcm: &[u8]) -> Result<usize> {
        let writer = self
            .writer
            .as_mut()
            .ok_or(EchoError::Closed("raw pcm output"))?;
        writer.write_all(pcm)?;
        Ok(pcm.len())
    }

    fn play_state(&self) -> PlayState {
        self.state
    }

    fn release(&mut self) {
        if let Some(mut writer) = self.writer.take() {
            if let Err(err) = writer.flush() {
                tracing::warn!(%err, "failed to flush raw pcm output");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn memory_device_records_writes_and_failures() {
        let mut device = MemoryDevice::open(AudioOutputSpec::for_tone(&ToneConfig::default()))
            .failing_writes(1);
        let log = device.log();

        device.play().unwrap();
        assert!(device.write(&[1, 2]).is_err());
        assert_eq!(device.write(&[3, 4]).unwrap(), 2);
        device.release();

        assert_eq!(log.write_count(), 1);
        assert_eq!(log.last_write().unwrap().state, PlayState::Playing);
        assert_eq!(log.max_concurrent_writes(), 1);
        assert!(log.is_released());
    }

    #[test]
    fn raw_file_device_appends_pcm() {
        let path = std::env::temp_dir().join(format!("echosight-raw-{}.pcm", std::process::id()));
        let spec = AudioOutputSpec::for_tone(&ToneConfig::default());
        let mut device = RawPcmFileDevice::open(&path, spec).unwrap();
        device.play().unwrap();
        device.write(&[1, 2, 3, 4]).unwrap();
        device.write(&[5, 6]).unwrap();
        device.release();

        let written = std::fs::read(&path).unwrap();
        std::fs::remove_file(&path).ok();
        assert_eq!(written, vec![1, 2, 3, 4, 5, 6]);
        assert!(device.write(&[7]).is_err());
    }
}
