//! Streaming driver for the CPC headstage.
//!
//! After the handshake the transport moves into a receiver, which runs
//! the receive loop either on a background thread or on the caller's thread.
//! The sample buffer and counters live behind a single mutex shared with
//! the consumer; everything else the loop touches is owned by the loop.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant, SystemTime};

use log::{debug, error, info, warn};
use ndarray::Array2;
use parking_lot::Mutex;

use crate::align::{Alignment, FrameAligner};
use crate::buffer::SampleBuffer;
use crate::config::HeadstageConfig;
use crate::errors::{DriverError, Result};
use crate::filter::HighPass;
use crate::handshake::{DeviceInfo, Handshake};
use crate::protocol::{encode_start, encode_stop};
use crate::rawlog::{RawByteLog, TextRawLog};
use crate::signal::{ChannelMap, SignalExtractor};
use crate::simulate::{SimulatedHeadstage, SimulatorOptions};
use crate::source::{SignalSource, SourceKind};
use crate::stats::{IterationCounts, Pacer, RateCounter, RateStats};
use crate::transport::{SerialTransport, Transport};
use crate::validate::{ErrorStats, MessageValidator};

/// Name of the background receive thread.
pub const RECEIVER_THREAD_NAME: &str = "CPCHSerial";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DriverState {
    Idle,
    Handshaking,
    Streaming,
    Closed,
}

// ============================================================================
// Shared state
// ============================================================================

#[derive(Debug)]
struct StreamState {
    buffer: SampleBuffer,
    errors: ErrorStats,
    total_messages: u64,
    rates: RateStats,
}

#[derive(Debug)]
struct Shared {
    stream: Mutex<StreamState>,
    running: AtomicBool,
}

impl Shared {
    fn new() -> Self {
        Self {
            stream: Mutex::new(StreamState {
                buffer: SampleBuffer::new(0, 0),
                errors: ErrorStats::default(),
                total_messages: 0,
                rates: RateStats::default(),
            }),
            running: AtomicBool::new(false),
        }
    }
}

// ============================================================================
// Receive loop
// ============================================================================

/// Per-connection decoding stages; fixed once the handshake succeeds.
#[derive(Debug, Clone)]
struct Pipeline {
    map: ChannelMap,
    aligner: FrameAligner,
    validator: MessageValidator,
    extractor: SignalExtractor,
}

impl Pipeline {
    fn new(map: ChannelMap, config: &HeadstageConfig) -> Self {
        Self {
            aligner: FrameAligner::new(map.frame_size()),
            validator: MessageValidator::new(map.payload_size()),
            extractor: SignalExtractor::new(
                &map,
                config.gain_differential,
                config.gain_single_ended,
            ),
            map,
        }
    }
}

struct Receiver<T> {
    transport: T,
    pipeline: Pipeline,
    shared: Arc<Shared>,
    remainder: Vec<u8>,
    pacer: Pacer,
    rates: RateCounter,
    raw_log: Option<Box<dyn RawByteLog>>,
}

impl<T: Transport> Receiver<T> {
    /// One pass of the loop body: read, align, validate, decode, store.
    fn iterate(&mut self) -> Result<IterationCounts> {
        let fresh = self.transport.read_available()?;
        if let Some(log) = self.raw_log.as_mut() {
            if let Err(e) = log.append(&fresh, SystemTime::now()) {
                warn!("raw byte log write failed: {}", e);
            }
        }

        let mut data = std::mem::take(&mut self.remainder);
        data.extend_from_slice(&fresh);

        let Alignment {
            frames, remainder, ..
        } = self.pipeline.aligner.align(&data);
        self.remainder = remainder;

        let mut counts = IterationCounts {
            bytes: data.len(),
            available_bytes: fresh.len(),
            aligned_bytes: frames.iter().map(Vec::len).sum(),
            ..IterationCounts::default()
        };
        if frames.is_empty() {
            debug!("no CPCH frames in {} bytes", data.len());
            return Ok(counts);
        }

        let validation = self.pipeline.validator.validate(&frames);
        counts.valid_messages = validation.accepted.len();
        counts.valid_bytes = validation.accepted.iter().map(|f| f.len()).sum();

        let samples = validation
            .has_valid_data()
            .then(|| self.pipeline.extractor.extract(&validation.accepted));

        let mut stream = self.shared.stream.lock();
        stream.errors += validation.stats;
        stream.total_messages += frames.len() as u64;
        if let Some(samples) = &samples {
            stream.buffer.push(samples, &self.pipeline.map);
        }
        Ok(counts)
    }

    /// Loop body plus rate bookkeeping and pacing.
    fn step(&mut self, loop_start: Instant, slept: Duration) -> Result<()> {
        let counts = self.iterate()?;
        let now = Instant::now();
        let window_start = loop_start.checked_sub(slept).unwrap_or(loop_start);
        if let Some(rates) = self.rates.record(counts, window_start, now) {
            self.shared.stream.lock().rates = rates;
        }
        self.pacer.update(loop_start, now);
        Ok(())
    }

    fn stream(&mut self, deadline: Option<Instant>) -> Result<()> {
        while self.shared.running.load(Ordering::SeqCst) {
            if deadline.is_some_and(|d| Instant::now() >= d) {
                info!("CPCH stream duration reached");
                break;
            }
            let slept = self.pacer.next_sleep();
            thread::sleep(slept);
            self.step(Instant::now(), slept)?;
        }
        Ok(())
    }

    /// Run until stopped, the deadline passes, or the transport fails.
    /// Hands the receiver back so the transport can be reused.
    fn run(mut self, deadline: Option<Instant>) -> (Self, Result<()>) {
        debug!("CPCH receive loop started");
        let result = self.stream(deadline);
        if let Err(e) = &result {
            error!("CPCH receive loop stopped: {}", e);
        }
        self.shared.running.store(false, Ordering::SeqCst);
        debug!("CPCH receive loop exited");
        (self, result)
    }
}

/// Who currently owns the transport.
enum Link<T> {
    /// Not yet configured.
    Detached(T),
    /// Configured, loop not running.
    Ready(Receiver<T>),
    /// Loop running on the receiver thread.
    Running(JoinHandle<(Receiver<T>, Result<()>)>),
    /// Closed.
    Gone,
}

// ============================================================================
// Driver
// ============================================================================

/// CPC headstage driver over any [`Transport`].
pub struct Headstage<T: Transport + 'static> {
    config: HeadstageConfig,
    kind: SourceKind,
    handshake: Handshake,
    state: DriverState,
    link: Link<T>,
    shared: Arc<Shared>,
    map: Option<ChannelMap>,
    device: Option<DeviceInfo>,
    filter: Option<HighPass>,
}

impl Headstage<SerialTransport> {
    /// Open the serial port named in `config`. Does not talk to the device yet.
    pub fn open(config: HeadstageConfig) -> Result<Self> {
        let transport = SerialTransport::from_config(&config)?;
        Ok(Self::new(transport, config))
    }
}

impl Headstage<SimulatedHeadstage> {
    pub fn simulated(config: HeadstageConfig, options: SimulatorOptions) -> Self {
        Self::new(SimulatedHeadstage::new(options), config).with_kind(SourceKind::Simulated)
    }
}

impl<T: Transport + 'static> Headstage<T> {
    pub fn new(transport: T, config: HeadstageConfig) -> Self {
        Self {
            config,
            kind: SourceKind::SerialHeadstage,
            handshake: Handshake::default(),
            state: DriverState::Idle,
            link: Link::Detached(transport),
            shared: Arc::new(Shared::new()),
            map: None,
            device: None,
            filter: None,
        }
    }

    /// Tag reported through [`SignalSource::kind`]; serial headstage by default.
    pub fn with_kind(mut self, kind: SourceKind) -> Self {
        self.kind = kind;
        self
    }

    /// Override handshake timing (drain delay and poll bound).
    pub fn with_handshake(mut self, handshake: Handshake) -> Self {
        self.handshake = handshake;
        self
    }

    pub fn config(&self) -> &HeadstageConfig {
        &self.config
    }

    /// Current state. A loop that died on a transport fault reports `Idle`.
    pub fn state(&self) -> DriverState {
        match (&self.link, self.state) {
            (Link::Running(handle), DriverState::Streaming) if handle.is_finished() => {
                DriverState::Idle
            }
            (_, state) => state,
        }
    }

    /// Active channels, known once connected.
    pub fn channel_map(&self) -> Option<&ChannelMap> {
        self.map.as_ref()
    }

    pub fn device_info(&self) -> Option<DeviceInfo> {
        self.device
    }

    fn ensure_open(&self) -> Result<()> {
        if self.state == DriverState::Closed {
            return Err(DriverError::NotReady("driver is closed".into()));
        }
        Ok(())
    }

    /// Run the handshake and prepare the receive pipeline. No-op when already connected.
    pub fn connect(&mut self) -> Result<()> {
        self.ensure_open()?;
        let mut transport = match std::mem::replace(&mut self.link, Link::Gone) {
            Link::Detached(transport) => transport,
            other => {
                self.link = other;
                return Ok(());
            }
        };

        if let Err(e) = self.config.validate() {
            self.link = Link::Detached(transport);
            return Err(e);
        }

        self.state = DriverState::Handshaking;
        let map = self.config.channel_map();
        let setup = self
            .handshake
            .run(&mut transport, &map)
            .and_then(|device| Ok((device, self.build_filter()?)));
        let (device, filter) = match setup {
            Ok(done) => done,
            Err(e) => {
                self.state = DriverState::Idle;
                self.link = Link::Detached(transport);
                return Err(e);
            }
        };

        {
            let mut stream = self.shared.stream.lock();
            stream.buffer = SampleBuffer::new(self.config.num_samples, map.total());
            stream.errors = ErrorStats::default();
            stream.total_messages = 0;
            stream.rates = RateStats::default();
        }

        let receiver = Receiver {
            transport,
            pipeline: Pipeline::new(map.clone(), &self.config),
            shared: Arc::clone(&self.shared),
            remainder: Vec::new(),
            pacer: Pacer::new(self.config.loop_period()),
            rates: RateCounter::new(self.config.rate_window()),
            raw_log: self.open_raw_log(),
        };

        self.link = Link::Ready(receiver);
        self.map = Some(map);
        self.device = Some(device);
        self.filter = filter;
        self.state = DriverState::Idle;
        Ok(())
    }

    fn build_filter(&self) -> Result<Option<HighPass>> {
        if !self.config.filter.enabled {
            return Ok(None);
        }
        HighPass::from_config(&self.config.filter, self.config.sample_frequency).map(Some)
    }

    fn open_raw_log(&self) -> Option<Box<dyn RawByteLog>> {
        let path = self.config.raw_log_path.as_ref()?;
        match TextRawLog::create(path) {
            Ok(log) => Some(Box::new(log)),
            Err(e) => {
                warn!("raw byte log {} unavailable: {}", path.display(), e);
                None
            }
        }
    }

    /// Start streaming, connecting first if needed.
    ///
    /// With `stream_on_thread` off this blocks for `stream_duration_secs`
    /// and returns with the driver idle again.
    /// Returns the transport fault that ended a background loop on its own,
    /// before any restart.
    pub fn start(&mut self) -> Result<()> {
        self.ensure_open()?;
        self.reap_finished_loop()?;
        if matches!(self.link, Link::Running(_)) {
            return Ok(());
        }
        self.connect()?;

        let deadline = self.config.stream_duration().map(|d| Instant::now() + d);
        if !self.config.stream_on_thread && deadline.is_none() {
            return Err(DriverError::Config(
                "stream_duration_secs is required when stream_on_thread is false".into(),
            ));
        }

        let Link::Ready(mut receiver) = std::mem::replace(&mut self.link, Link::Gone) else {
            return Err(DriverError::NotReady("driver is not connected".into()));
        };
        if let Err(e) = begin_streaming(&mut receiver) {
            self.link = Link::Ready(receiver);
            return Err(e);
        }
        self.shared.running.store(true, Ordering::SeqCst);
        self.state = DriverState::Streaming;

        if !self.config.stream_on_thread {
            let (receiver, result) = receiver.run(deadline);
            self.link = Link::Ready(receiver);
            return self.finish(result);
        }

        let spawned = thread::Builder::new()
            .name(RECEIVER_THREAD_NAME.to_string())
            .spawn(move || receiver.run(deadline));
        match spawned {
            Ok(handle) => {
                self.link = Link::Running(handle);
                info!("CPCH streaming started on thread {}", RECEIVER_THREAD_NAME);
                Ok(())
            }
            Err(e) => {
                // The receiver, and with it the transport, went down with the closure.
                error!("could not spawn {}: {}", RECEIVER_THREAD_NAME, e);
                self.shared.running.store(false, Ordering::SeqCst);
                self.state = DriverState::Closed;
                Err(e.into())
            }
        }
    }

    /// Join a background loop that has already exited and hand back its result.
    fn reap_finished_loop(&mut self) -> Result<()> {
        match &self.link {
            Link::Running(handle) if handle.is_finished() => self.stop(),
            _ => Ok(()),
        }
    }

    /// Send STOP and settle in `Idle`, keeping the first error.
    fn finish(&mut self, result: Result<()>) -> Result<()> {
        let stopped = match &mut self.link {
            Link::Ready(receiver) => receiver.transport.write(&encode_stop()),
            _ => Ok(()),
        };
        self.state = DriverState::Idle;
        info!("CPCH streaming stopped");
        result.and(stopped)
    }

    /// Stop the receive loop and the device stream.
    ///
    /// Returns the transport fault that ended the loop, if there was one.
    pub fn stop(&mut self) -> Result<()> {
        let handle = match std::mem::replace(&mut self.link, Link::Gone) {
            Link::Running(handle) => handle,
            other => {
                self.link = other;
                return Ok(());
            }
        };

        self.shared.running.store(false, Ordering::SeqCst);
        match handle.join() {
            Ok((receiver, result)) => {
                self.link = Link::Ready(receiver);
                self.finish(result)
            }
            Err(_) => {
                error!("CPCH receiver thread panicked");
                self.state = DriverState::Closed;
                Err(DriverError::NotReady("receiver thread panicked".into()))
            }
        }
    }

    /// Run exactly one loop iteration on the calling thread.
    pub fn poll_once(&mut self) -> Result<()> {
        self.ensure_open()?;
        self.connect()?;
        match &mut self.link {
            Link::Ready(receiver) => receiver.step(Instant::now(), Duration::ZERO),
            _ => Err(DriverError::NotReady(
                "receive loop is not available on this thread".into(),
            )),
        }
    }

    /// Stop, release the transport and refuse further use.
    pub fn close(&mut self) -> Result<()> {
        if self.state == DriverState::Closed {
            return Ok(());
        }
        let stopped = self.stop();
        let closed = match &mut self.link {
            Link::Ready(receiver) => receiver.transport.close(),
            Link::Detached(transport) => transport.close(),
            Link::Running(_) | Link::Gone => Ok(()),
        };
        self.link = Link::Gone;
        self.state = DriverState::Closed;
        info!("CPCH driver closed");
        stopped.and(closed)
    }

    /// Newest `num_samples` rows of the selected columns, high-pass filtered.
    ///
    /// Connects and starts streaming first when needed. `num_samples`
    /// defaults to, and is clamped to, the buffer height; `channels`
    /// defaults to every column. A transport fault that ended the receive
    /// loop is returned once; the call after that tries to restart.
    pub fn get_data(
        &mut self,
        num_samples: Option<usize>,
        channels: Option<&[usize]>,
    ) -> Result<Array2<f64>> {
        self.ensure_open()?;
        self.reap_finished_loop()?;
        if matches!(self.link, Link::Detached(_) | Link::Ready(_)) {
            self.start()?;
        }

        let window = self.snapshot(num_samples, channels)?;
        Ok(match self.filter.as_ref() {
            Some(filter) => filter.filtfilt_columns(&window),
            None => window,
        })
    }

    /// Unfiltered copy of the newest rows. Never starts streaming.
    pub fn snapshot(
        &self,
        num_samples: Option<usize>,
        channels: Option<&[usize]>,
    ) -> Result<Array2<f64>> {
        let width = self.map.as_ref().map_or(0, ChannelMap::total);
        let all: Vec<usize>;
        let channels = match channels {
            Some(channels) => {
                if let Some(&bad) = channels.iter().find(|&&c| c >= width) {
                    return Err(DriverError::Config(format!(
                        "channel {bad} out of range, {width} channels active"
                    )));
                }
                channels
            }
            None => {
                all = (0..width).collect();
                &all
            }
        };

        let stream = self.shared.stream.lock();
        Ok(stream
            .buffer
            .latest(num_samples.unwrap_or(usize::MAX), channels))
    }

    /// `CPCH: <rate>Hz <kbps>kbps` from the last completed rate window.
    pub fn status_text(&self) -> String {
        let rates = self.rate_stats();
        format!(
            "CPCH: {:.0}Hz {:.1}kbps",
            rates.valid_message_rate,
            rates.byte_rate / 1000.0 * 8.0
        )
    }

    pub fn rate_stats(&self) -> RateStats {
        self.shared.stream.lock().rates
    }

    /// Frame defects accumulated since connect or the last reset.
    pub fn error_totals(&self) -> ErrorStats {
        self.shared.stream.lock().errors
    }

    /// Candidate frames seen since connect or the last reset.
    pub fn total_messages(&self) -> u64 {
        self.shared.stream.lock().total_messages
    }

    pub fn reset_error_stats(&self) {
        let mut stream = self.shared.stream.lock();
        stream.errors = ErrorStats::default();
        stream.total_messages = 0;
    }
}

/// Discard stale input and tell the device to start sending.
fn begin_streaming<T: Transport>(receiver: &mut Receiver<T>) -> Result<()> {
    let stale = receiver.transport.read_available()?;
    if !stale.is_empty() {
        debug!("discarded {} stale bytes before START", stale.len());
    }
    receiver.remainder.clear();
    receiver.pacer = Pacer::new(receiver.pacer.target());
    receiver.transport.write(&encode_start())
}

impl<T: Transport + 'static> Drop for Headstage<T> {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            warn!("error while closing CPCH driver: {}", e);
        }
    }
}

impl<T: Transport + 'static> SignalSource for Headstage<T> {
    fn kind(&self) -> SourceKind {
        self.kind
    }

    fn connect(&mut self) -> Result<()> {
        Headstage::connect(self)
    }

    fn get_data(
        &mut self,
        num_samples: Option<usize>,
        channels: Option<&[usize]>,
    ) -> Result<Array2<f64>> {
        Headstage::get_data(self, num_samples, channels)
    }

    fn status_text(&self) -> String {
        Headstage::status_text(self)
    }

    fn close(&mut self) -> Result<()> {
        Headstage::close(self)
    }
}
