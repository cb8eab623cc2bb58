//! Acquisition engine.
//!
//! [`Engine`] is the handle a UI (or the CLI) holds. Behind it a single
//! tokio task, the acquisition loop, drives `Link -> ChunkReader -> parse ->
//! SeriesStore` whenever the mode is [`Mode::Streaming`].
//!
//! # Concurrency
//!
//! The link sits behind a `tokio::sync::Mutex`; every blocking exchange
//! runs on the blocking pool with that lock held, so collaborator requests
//! (mode changes, single-sample requests) land between loop cycles, never
//! inside one. The loop is the only writer of the stream series.
//!
//! # Pacing
//!
//! Between cycles the loop sleeps `pacing_factor x n_reads_per_chunk x
//! sample_delay_ms`, waking a little before the next chunk is due. This is a
//! throughput knob, not a correctness requirement: with the Count strategy
//! the reads themselves block until data arrives.

use std::sync::Arc;

use log::{debug, info, trace, warn};
use tokio::sync::{oneshot, watch, Mutex};
use tokio::task::JoinHandle;

use crate::config::DaqConfig;
use crate::errors::{DaqError, Result};
use crate::link::Link;
use crate::parser::{parse, parse_reply};
use crate::protocol::{encode_stream_delay, Command, LINE_END};
use crate::reader::ChunkReader;
use crate::series::{Sample, SeriesCursor, SeriesStore};

type SharedLink = Arc<Mutex<Link>>;

/// Acquisition mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Mode {
    /// Samples are fetched one at a time via [`Engine::request_single_sample`].
    #[default]
    OnDemand,
    /// The device emits continuously and the loop collects.
    Streaming,
}

/// Mode plus a counter of streaming sessions. Every `OnDemand -> Streaming`
/// transition starts a new session, so the loop re-arms the device even if
/// it never got to see the `OnDemand` in between.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
struct ModeState {
    mode: Mode,
    session: u64,
}

/// Why the acquisition loop ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StopReason {
    /// [`Engine::shutdown`] was called, or the engine was dropped while its
    /// runtime kept running.
    Shutdown,
    /// The device went away.
    LinkClosed(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineStatus {
    Running,
    Stopped(StopReason),
}

/// Run `f` against the link on the blocking pool.
async fn with_link<T, F>(link: &SharedLink, f: F) -> Result<T>
where
    F: FnOnce(&mut Link) -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    let link = Arc::clone(link);
    tokio::task::spawn_blocking(move || {
        let mut guard = link.blocking_lock();
        f(&mut guard)
    })
    .await
    .map_err(|e| DaqError::Task(e.to_string()))?
}

// ============================================================================
// Engine
// ============================================================================

/// Collaborator-facing handle to a running acquisition loop.
///
/// # Example
/// ```ignore
/// let config = DaqConfig { port: Some("/dev/ttyACM0".into()), ..Default::default() };
/// let mut engine = Engine::connect(config).await?;
/// engine.set_mode(Mode::Streaming).await?;
/// let mut cursor = SeriesCursor::start();
/// loop {
///     for sample in cursor.next_batch(engine.series()) { /* plot */ }
///     tokio::time::sleep(Duration::from_millis(90)).await;
/// }
/// ```
pub struct Engine {
    link: SharedLink,
    config: Arc<DaqConfig>,
    series: SeriesStore,
    on_demand: SeriesStore,
    mode_tx: watch::Sender<ModeState>,
    status_rx: watch::Receiver<EngineStatus>,
    shutdown_tx: Option<oneshot::Sender<()>>,
    task: Option<JoinHandle<Result<()>>>,
}

impl Engine {
    /// Open the configured port, handshake, and start the loop.
    pub async fn connect(config: DaqConfig) -> Result<Self> {
        config.validate()?;
        let port = config
            .port
            .clone()
            .ok_or_else(|| DaqError::Config("no serial port configured".into()))?;
        let (baud, timeout, opcodes) = (config.baud_rate, config.read_timeout(), config.opcodes);

        let link = tokio::task::spawn_blocking(move || {
            Link::open(&port, baud, timeout).map(|link| link.with_opcodes(opcodes))
        })
        .await
        .map_err(|e| DaqError::Task(e.to_string()))??;

        Self::start(link, config).await
    }

    /// Handshake on an already-open link, then start the loop.
    ///
    /// This is the only place a handshake happens: once the loop runs, the
    /// link is never reset again.
    pub async fn start(link: Link, config: DaqConfig) -> Result<Self> {
        config.validate()?;
        let (settle, timeout, exchanges) = (
            config.settle_delay(),
            config.handshake_timeout(),
            config.handshake_exchanges,
        );
        let link = tokio::task::spawn_blocking(move || {
            let mut link = link;
            link.handshake(settle, timeout, exchanges).map(|_| link)
        })
        .await
        .map_err(|e| DaqError::Task(e.to_string()))??;
        info!("handshake complete");

        Self::spawn(link, config)
    }

    /// Start the loop on a link that is ready to use. Must be called from
    /// within a tokio runtime.
    pub fn spawn(link: Link, config: DaqConfig) -> Result<Self> {
        config.validate()?;
        let mut link = link.with_opcodes(config.opcodes);
        link.set_timeout(config.read_timeout())?;

        let link = Arc::new(Mutex::new(link));
        let config = Arc::new(config);
        let series = SeriesStore::new();
        let (mode_tx, mode_rx) = watch::channel(ModeState::default());
        let (status_tx, status_rx) = watch::channel(EngineStatus::Running);
        let (shutdown_tx, shutdown_rx) = oneshot::channel();

        let acquisition = AcquisitionLoop {
            link: Arc::clone(&link),
            config: Arc::clone(&config),
            reader: config.chunk_reader(),
            series: series.clone(),
            mode_rx,
            status_tx,
            armed_session: None,
            carry_over: Vec::new(),
        };
        let task = tokio::spawn(acquisition.run(shutdown_rx));

        Ok(Self {
            link,
            config,
            series,
            on_demand: SeriesStore::new(),
            mode_tx,
            status_rx,
            shutdown_tx: Some(shutdown_tx),
            task: Some(task),
        })
    }

    pub fn config(&self) -> &DaqConfig {
        &self.config
    }

    pub fn mode(&self) -> Mode {
        self.mode_tx.borrow().mode
    }

    /// Switch acquisition mode.
    ///
    /// Leaving streaming sends `StopStream` right away and flushes whatever
    /// the device already queued; the loop picks up the new mode at its next
    /// cycle boundary. Entering streaming leaves arming to the loop.
    pub async fn set_mode(&self, mode: Mode) -> Result<()> {
        self.ensure_running()?;

        let mut previous = mode;
        self.mode_tx.send_if_modified(|state| {
            previous = state.mode;
            if state.mode == mode {
                return false;
            }
            if mode == Mode::Streaming {
                state.session += 1;
            }
            state.mode = mode;
            true
        });
        if previous == mode {
            return Ok(());
        }
        info!("mode {:?} -> {:?}", previous, mode);

        if previous == Mode::Streaming {
            with_link(&self.link, |link| {
                link.send(Command::StopStream, &[])?;
                link.clear_input()
            })
            .await?;
        }
        Ok(())
    }

    /// Fetch one sample.
    ///
    /// On demand this asks the device and waits up to the read timeout for
    /// its reply. While streaming, the device is busy, so the most recent
    /// streamed sample is returned instead. Either way the sample is also
    /// recorded in the on-demand series.
    pub async fn request_single_sample(&self) -> Result<Sample> {
        self.ensure_running()?;

        let sample = match self.mode() {
            Mode::Streaming => self.series.last().ok_or(DaqError::NoSamples)?,
            Mode::OnDemand => {
                let decoder = self.config.decoder.clone();
                with_link(&self.link, move |link| {
                    link.send(Command::SingleSampleRequest, &[])?;
                    let line = link.read_line()?;
                    if line.last() != Some(&LINE_END) {
                        return Err(DaqError::Timeout(format!(
                            "no reply to sample request within {:?}",
                            link.timeout()
                        )));
                    }
                    parse_reply(&line, &decoder)
                })
                .await?
            }
        };
        self.on_demand.push(sample);
        Ok(sample)
    }

    /// Stream series handle, for consumers that poll with a [`SeriesCursor`].
    pub fn series(&self) -> &SeriesStore {
        &self.series
    }

    /// Samples collected by single-sample requests.
    pub fn on_demand_series(&self) -> &SeriesStore {
        &self.on_demand
    }

    pub fn snapshot(&self) -> Vec<Sample> {
        self.series.snapshot()
    }

    pub fn on_demand_snapshot(&self) -> Vec<Sample> {
        self.on_demand.snapshot()
    }

    /// Cursor at the current end of the stream series.
    pub fn cursor(&self) -> SeriesCursor {
        self.series.cursor()
    }

    /// Clear the stream series. Outstanding cursors rewind on their next batch.
    pub fn reset(&self) {
        self.series.reset();
    }

    pub fn reset_on_demand(&self) {
        self.on_demand.reset();
    }

    pub async fn is_open(&self) -> bool {
        self.link.lock().await.is_open()
    }

    pub fn status(&self) -> EngineStatus {
        self.status_rx.borrow().clone()
    }

    pub fn subscribe_status(&self) -> watch::Receiver<EngineStatus> {
        self.status_rx.clone()
    }

    /// Resolve once the loop has ended, for whatever reason.
    pub async fn wait_stopped(&self) -> StopReason {
        let mut rx = self.status_rx.clone();
        let stopped = rx
            .wait_for(|status| matches!(status, EngineStatus::Stopped(_)))
            .await
            .map(|status| status.clone());
        match stopped {
            Ok(EngineStatus::Stopped(reason)) => reason,
            // The loop always publishes before exiting, so a closed channel
            // means it is gone.
            _ => StopReason::Shutdown,
        }
    }

    /// Stop the loop and wait for it. The loop sends `StopStream` and closes
    /// the link on its way out. If the loop already died on a link failure,
    /// that error is returned here once.
    pub async fn shutdown(&mut self) -> Result<()> {
        if let Some(shutdown_tx) = self.shutdown_tx.take() {
            let _ = shutdown_tx.send(());
        }
        match self.task.take() {
            Some(task) => task.await.map_err(|e| DaqError::Task(e.to_string()))?,
            None => Ok(()),
        }
    }

    fn ensure_running(&self) -> Result<()> {
        match &*self.status_rx.borrow() {
            EngineStatus::Running => Ok(()),
            EngineStatus::Stopped(StopReason::LinkClosed(reason)) => {
                Err(DaqError::LinkClosed(reason.clone()))
            }
            EngineStatus::Stopped(StopReason::Shutdown) => {
                Err(DaqError::LinkClosed("engine was shut down".into()))
            }
        }
    }
}

// ============================================================================
// Acquisition loop
// ============================================================================

struct AcquisitionLoop {
    link: SharedLink,
    config: Arc<DaqConfig>,
    reader: ChunkReader,
    series: SeriesStore,
    mode_rx: watch::Receiver<ModeState>,
    status_tx: watch::Sender<EngineStatus>,
    /// Streaming session the device is currently armed for.
    armed_session: Option<u64>,
    /// Unterminated bytes from the previous chunk.
    carry_over: Vec<u8>,
}

impl AcquisitionLoop {
    async fn run(mut self, mut shutdown_rx: oneshot::Receiver<()>) -> Result<()> {
        let pacing = self.config.pacing_interval();
        debug!("acquisition loop started, pacing {:?}", pacing);

        let outcome = loop {
            if !matches!(shutdown_rx.try_recv(), Err(oneshot::error::TryRecvError::Empty)) {
                break Ok(());
            }

            if let Err(e) = self.cycle().await {
                if e.is_fatal() {
                    break Err(e);
                }
                warn!("acquisition cycle failed: {}", e);
            }

            tokio::select! {
                _ = &mut shutdown_rx => break Ok(()),
                _ = tokio::time::sleep(pacing) => {}
            }
        };

        self.finish().await;

        let reason = match &outcome {
            Ok(()) => StopReason::Shutdown,
            Err(e) => StopReason::LinkClosed(e.to_string()),
        };
        info!("acquisition loop stopped: {:?}", reason);
        self.status_tx.send_replace(EngineStatus::Stopped(reason));
        outcome
    }

    async fn cycle(&mut self) -> Result<()> {
        if !self.link.lock().await.is_open() {
            return Err(DaqError::LinkClosed("device disconnected".into()));
        }

        let state = *self.mode_rx.borrow_and_update();
        if state.mode == Mode::OnDemand {
            if self.armed_session.take().is_some() {
                debug!("stream disarmed");
            }
            return Ok(());
        }

        let arm = self.armed_session != Some(state.session);
        if arm {
            self.carry_over.clear();
        }
        let carry_over = std::mem::take(&mut self.carry_over);
        let config = Arc::clone(&self.config);
        let reader = self.reader;
        let mode_rx = self.mode_rx.clone();

        let raw = with_link(&self.link, move |link| {
            // The mode may have changed while this cycle waited for the link.
            if *mode_rx.borrow() != state {
                return Ok(None);
            }
            if arm {
                arm_stream(link, &config)?;
            }
            reader.read_chunk(link, carry_over).map(Some)
        })
        .await?;

        let Some(raw) = raw else {
            return Ok(());
        };
        if arm {
            info!(
                "streaming armed: delay={}ms, session={}",
                self.config.sample_delay_ms, state.session
            );
            self.armed_session = Some(state.session);
        }

        let chunk = parse(&raw, &self.config.decoder);
        if chunk.is_pending() {
            trace!("no complete record yet ({} bytes carried)", chunk.remainder.len());
        }
        if let Some(first) = chunk.dropped.first() {
            warn!(
                "dropped {} malformed records in chunk (first: {})",
                chunk.dropped.len(),
                first
            );
        }
        self.series.append(&chunk.samples);
        self.carry_over = chunk.remainder;
        Ok(())
    }

    /// Always leave the device quiet and the port released.
    async fn finish(&mut self) {
        let cleanup = with_link(&self.link, |link| {
            if link.is_open() {
                if let Err(e) = link.send(Command::StopStream, &[]) {
                    warn!("could not stop stream during shutdown: {}", e);
                }
            }
            link.close();
            Ok(())
        })
        .await;
        if let Err(e) = cleanup {
            warn!("link cleanup failed: {}", e);
        }
    }
}

/// Configure and start the stream, then discard the warm-up lines.
fn arm_stream(link: &mut Link, config: &DaqConfig) -> Result<()> {
    link.clear_input()?;
    link.send(
        Command::SetStreamDelay,
        &encode_stream_delay(config.sample_delay_ms),
    )?;
    link.send(Command::StartStream, &[])?;
    let discarded = link.read_lines(config.warmup_reads)?;
    debug!(
        "discarded {} warm-up bytes ({} reads)",
        discarded.len(),
        config.warmup_reads
    );
    Ok(())
}
