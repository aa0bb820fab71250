use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam::atomic::AtomicCell;
use parking_lot::{Condvar, Mutex};

use crate::config::ToneConfig;
use crate::mailbox::{Deposit, Mailbox};
use crate::tone::ToneGenerator;
use crate::{EchoError, Result};

pub mod device;

pub use device::{
    AudioDevice, AudioOutputSpec, ChannelLayout, DeviceLog, MemoryDevice, PlayState,
    RawPcmFileDevice, SampleEncoding, StreamMode, WriteRecord,
};

/// Output state requested from the engine.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum SoundState {
    #[default]
    Stopped,
    Playing,
}

/// Counters describing what the tone worker has done so far.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct SoundStats {
    pub tones_written: u64,
    /// Requests replaced by a newer one before they reached the device.
    pub superseded: u64,
    pub write_failures: u64,
    pub last_frequency_hz: Option<f64>,
}

#[derive(Debug, Clone, Copy)]
enum CommandKind {
    Tone(f64),
    Stop,
}

#[derive(Debug, Clone, Copy)]
struct Command {
    seq: u64,
    kind: CommandKind,
}

struct Shared {
    requests: Mailbox<Command>,
    state: AtomicCell<SoundState>,
    submitted: Mutex<u64>,
    settled: Mutex<u64>,
    settled_changed: Condvar,
    stats: Mutex<SoundStats>,
}

impl Shared {
    fn settle(&self, seq: u64) {
        let mut settled = self.settled.lock();
        *settled = (*settled).max(seq);
        self.settled_changed.notify_all();
    }
}

/// Turns distances into an audible tone.
///
/// All generation and device access happens on one dedicated worker fed by a
/// depth-1 request slot, so at most one generate-and-write cycle is in flight
/// and the newest request always wins. The worker owns the device and
/// releases it itself once the engine is shut down.
pub struct SoundEngine {
    shared: Arc<Shared>,
    worker: Mutex<Option<JoinHandle<()>>>,
    config: ToneConfig,
}

impl SoundEngine {
    pub fn spawn(config: ToneConfig, device: Box<dyn AudioDevice>) -> Result<Self> {
        config.validate()?;

        let shared = Arc::new(Shared {
            requests: Mailbox::new(),
            state: AtomicCell::new(SoundState::Stopped),
            submitted: Mutex::new(0),
            settled: Mutex::new(0),
            settled_changed: Condvar::new(),
            stats: Mutex::new(SoundStats::default()),
        });

        let worker = thread::Builder::new().name("echosight-tone".into()).spawn({
            let shared = shared.clone();
            let generator = ToneGenerator::new(config.clone());
            move || run_worker(shared, generator, device)
        })?;

        Ok(Self {
            shared,
            worker: Mutex::new(Some(worker)),
            config,
        })
    }

    pub fn config(&self) -> &ToneConfig {
        &self.config
    }

    /// Starts output if needed and requests a tone for `distance`, replacing
    /// any request the worker has not picked up yet.
    pub fn start_from(&self, distance: f64) -> Result<()> {
        self.submit(CommandKind::Tone(distance))
    }

    /// Stops output. Does nothing when already stopped.
    pub fn stop(&self) -> Result<()> {
        self.submit(CommandKind::Stop)
    }

    pub fn state(&self) -> SoundState {
        self.shared.state.load()
    }

    pub fn stats(&self) -> SoundStats {
        *self.shared.stats.lock()
    }

    /// Waits until every request submitted so far has been written, dropped
    /// as superseded, or abandoned by shutdown. A timeout too large to
    /// represent as a deadline waits without one.
    pub fn wait_idle(&self, timeout: Duration) -> bool {
        let deadline = Instant::now().checked_add(timeout);
        let target = *self.shared.submitted.lock();
        let mut settled = self.shared.settled.lock();
        while *settled < target {
            match deadline {
                Some(deadline) => {
                    if self
                        .shared
                        .settled_changed
                        .wait_until(&mut settled, deadline)
                        .timed_out()
                    {
                        return *settled >= target;
                    }
                }
                None => self.shared.settled_changed.wait(&mut settled),
            }
        }
        true
    }

    /// Closes the request slot and joins the worker. The worker finishes the
    /// cycle it is running, stops and releases the device, then exits.
    pub fn shutdown(&self) {
        self.shared.requests.close();
        let Some(worker) = self.worker.lock().take() else {
            return;
        };
        if worker.join().is_err() {
            tracing::error!("tone worker panicked");
        }
        self.shared.state.store(SoundState::Stopped);
        tracing::info!("sound engine stopped");
    }

    fn submit(&self, kind: CommandKind) -> Result<()> {
        let mut submitted = self.shared.submitted.lock();
        if self.shared.requests.is_closed() {
            return Err(EchoError::Closed("sound engine"));
        }

        match kind {
            CommandKind::Tone(_) => self.shared.state.store(SoundState::Playing),
            CommandKind::Stop => {
                if self.shared.state.swap(SoundState::Stopped) == SoundState::Stopped {
                    return Ok(());
                }
            }
        }

        *submitted += 1;
        match self.shared.requests.deposit(Command {
            seq: *submitted,
            kind,
        }) {
            Deposit::Stored => Ok(()),
            Deposit::Replaced => {
                self.shared.stats.lock().superseded += 1;
                Ok(())
            }
            Deposit::Closed => Err(EchoError::Closed("sound engine")),
        }
    }
}

impl Drop for SoundEngine {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl std::fmt::Debug for SoundEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SoundEngine")
            .field("state", &self.state())
            .field("stats", &self.stats())
            .finish()
    }
}

fn run_worker(shared: Arc<Shared>, mut generator: ToneGenerator, mut device: Box<dyn AudioDevice>) {
    tracing::debug!(spec = ?device.spec(), "tone worker started");

    while let Some(command) = shared.requests.take_blocking() {
        match command.kind {
            CommandKind::Tone(distance) => {
                play_tone(&shared, &mut generator, device.as_mut(), distance)
            }
            CommandKind::Stop => {
                if device.play_state() == PlayState::Playing {
                    if let Err(err) = device.stop() {
                        tracing::warn!(%err, "failed to stop tone output");
                    } else {
                        tracing::debug!("tone output stopped");
                    }
                }
            }
        }
        shared.settle(command.seq);
    }

    if device.play_state() == PlayState::Playing {
        if let Err(err) = device.stop() {
            tracing::warn!(%err, "failed to stop tone output during shutdown");
        }
    }
    device.release();
    shared.settle(u64::MAX);
    tracing::debug!("tone worker exited");
}

fn play_tone(shared: &Shared, generator: &mut ToneGenerator, device: &mut dyn AudioDevice, distance: f64) {
    if device.play_state() != PlayState::Playing {
        if let Err(err) = device.play() {
            tracing::warn!(%err, "failed to start tone output");
            shared.stats.lock().write_failures += 1;
            return;
        }
        tracing::debug!("tone output started");
    }

    let (params, pcm) = generator.generate(distance);
    if shared.requests.has_pending() {
        tracing::trace!(distance, "tone superseded before write");
        shared.stats.lock().superseded += 1;
        return;
    }

    let expected = pcm.as_bytes().len();
    match device.write(pcm.as_bytes()) {
        Ok(written) if written == expected => {
            tracing::trace!(distance, frequency = params.frequency_hz, "tone written");
            let mut stats = shared.stats.lock();
            stats.tones_written += 1;
            stats.last_frequency_hz = Some(params.frequency_hz);
        }
        Ok(written) => {
            tracing::warn!(written, expected, "short write to audio device");
            shared.stats.lock().write_failures += 1;
        }
        Err(err) => {
            tracing::warn!(%err, "audio write failed, retrying on next tone");
            shared.stats.lock().write_failures += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{PcmBuffer, SpectrumProbe};

    const IDLE: Duration = Duration::from_secs(10);

    fn engine_with(device: MemoryDevice) -> (SoundEngine, Arc<DeviceLog>) {
        let log = device.log();
        let engine = SoundEngine::spawn(ToneConfig::default(), Box::new(device)).unwrap();
        (engine, log)
    }

    fn memory_device() -> MemoryDevice {
        MemoryDevice::open(AudioOutputSpec::for_tone(&ToneConfig::default()))
    }

    fn pitch_of(record: &WriteRecord) -> f64 {
        let pcm = PcmBuffer::from_bytes(record.bytes.clone(), 10_000);
        SpectrumProbe::new().dominant_frequency(&pcm).unwrap()
    }

    #[test]
    fn plays_a_clamped_tone() {
        let (engine, log) = engine_with(memory_device());

        engine.start_from(40.0).unwrap();
        assert_eq!(engine.state(), SoundState::Playing);
        assert!(engine.wait_idle(IDLE));

        let write = log.last_write().unwrap();
        assert_eq!(write.bytes.len(), 40_000);
        assert_eq!(write.state, PlayState::Playing);
        assert!((pitch_of(&write) - 100.0).abs() <= 1.0);
        assert_eq!(engine.stats().last_frequency_hz, Some(100.0));
        assert_eq!(log.plays(), 1);
    }

    #[test]
    fn oversized_tone_config_is_refused_at_spawn() {
        let config = ToneConfig {
            duration_seconds: 1e300,
            ..ToneConfig::default()
        };
        let device = memory_device();
        let log = device.log();

        let result = SoundEngine::spawn(config, Box::new(device));
        assert!(matches!(result, Err(EchoError::InvalidInput(_))));
        assert_eq!(log.write_count(), 0);
    }

    #[test]
    fn stop_is_idempotent() {
        let (engine, log) = engine_with(memory_device());

        engine.stop().unwrap();
        assert!(engine.wait_idle(IDLE));
        assert_eq!(log.stops(), 0);

        engine.start_from(300.0).unwrap();
        engine.stop().unwrap();
        engine.stop().unwrap();
        assert!(engine.wait_idle(IDLE));
        assert_eq!(engine.state(), SoundState::Stopped);
        assert!(log.stops() <= 1);
    }

    #[test]
    fn rapid_updates_never_overlap_and_latest_wins() {
        let device = memory_device().with_write_latency(Duration::from_millis(5));
        let (engine, log) = engine_with(device);

        for step in 0..50 {
            engine.start_from(100.0 + 10.0 * step as f64).unwrap();
        }
        assert!(engine.wait_idle(IDLE));

        assert_eq!(log.max_concurrent_writes(), 1);
        let writes = log.writes();
        assert!(!writes.is_empty());
        assert!(writes.iter().all(|write| write.bytes.len() == 40_000));
        assert!((pitch_of(writes.last().unwrap()) - 590.0).abs() <= 1.0);
        assert_eq!(engine.stats().last_frequency_hz, Some(590.0));
    }

    #[test]
    fn concurrent_callers_are_serialised() {
        let device = memory_device().with_write_latency(Duration::from_millis(2));
        let (engine, log) = engine_with(device);
        let engine = Arc::new(engine);

        let callers: Vec<_> = (0..5)
            .map(|caller| {
                let engine = engine.clone();
                thread::spawn(move || {
                    for step in 0..10 {
                        engine.start_from(200.0 + (caller * 10 + step) as f64).unwrap();
                    }
                })
            })
            .collect();
        for caller in callers {
            caller.join().unwrap();
        }
        engine.start_from(777.0).unwrap();
        assert!(engine.wait_idle(IDLE));

        assert_eq!(log.max_concurrent_writes(), 1);
        assert_eq!(engine.stats().last_frequency_hz, Some(777.0));
    }

    #[test]
    fn wait_idle_accepts_an_unbounded_timeout() {
        let (engine, log) = engine_with(memory_device());

        engine.start_from(320.0).unwrap();
        assert!(engine.wait_idle(Duration::MAX));
        assert_eq!(log.write_count(), 1);
    }

    #[test]
    fn failed_writes_are_retried_on_the_next_tone() {
        let (engine, log) = engine_with(memory_device().failing_writes(1));

        engine.start_from(200.0).unwrap();
        assert!(engine.wait_idle(IDLE));
        assert_eq!(engine.stats().write_failures, 1);
        assert_eq!(log.write_count(), 0);

        engine.start_from(300.0).unwrap();
        assert!(engine.wait_idle(IDLE));
        assert_eq!(engine.stats().tones_written, 1);
        assert_eq!(engine.state(), SoundState::Playing);
    }

    #[test]
    fn shutdown_releases_the_device_on_the_worker() {
        let device = memory_device().with_write_latency(Duration::from_millis(30));
        let (engine, log) = engine_with(device);

        engine.start_from(150.0).unwrap();
        engine.shutdown();

        assert!(log.is_released());
        assert!(log.max_concurrent_writes() <= 1);
        assert_eq!(engine.state(), SoundState::Stopped);
        assert!(matches!(engine.start_from(200.0), Err(EchoError::Closed(_))));
        assert!(engine.wait_idle(Duration::from_millis(10)));
    }
}
