//! Scan driver
//!
//! A [`Scan`] owns one [`AcquisitionChain`] and runs it exactly once:
//!
//! 1. validate the chain and claim it (structural and reuse errors are
//!    returned before any hardware call)
//! 2. watchdog `on_scan_new`, then scan presets' and chain presets' `prepare`
//! 3. per point: `wait_ready` level by level from the root down, iteration
//!    presets' `prepare`, `prepare` from the root down, presets' `start` (first
//!    point only), iteration presets' `start`, then `start` from the leaves up
//!    so every child is armed before the master that triggers it
//! 4. after each point the watchdog gets the channels that grew; under a
//!    continuous root it follows channel growth as it happens
//! 5. a completion pass joining reading tasks and waiting for readiness
//!    (bounded by the continuous timeout when the root is
//!    hardware-synchronous)
//! 6. whatever happened: `stop` on every started object from the leaves up,
//!    then presets' `stop`, then every channel is sealed
//!
//! Operator interrupts and watchdog verdicts cancel the point loop and go
//! through the same teardown as device faults.
//!
//! # Example
//!
//! ```rust,ignore
//! let scan = Scan::new("timescan", chain)?
//!     .with_config(&config)
//!     .with_preset(Arc::new(FastShutter::new()));
//!
//! let interrupt = scan.interrupt_handle();
//! let report = scan.run().await?;
//! println!("{} points, outcome {:?}", report.points, report.outcome);
//! println!("{}", scan.statistics());
//! ```

pub mod data;
pub mod info;
pub mod preset;
pub mod statistics;
pub mod watchdog;

use futures::future::BoxFuture;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use crate::acquisition::{AcqNode, Discipline, RunContext};
use crate::barrier;
use crate::chain::AcquisitionChain;
use crate::config::{EngineConfig, ScanConfig};
use crate::error::{Operation, PresetPhase, ScanError, ScanResult};

pub use data::ScanData;
pub use info::{ScanInfo, ScanMeta};
pub use preset::{ChainPreset, IterationPreset, ScanPreset};
pub use statistics::{CallStats, ScanStatistics};
pub use watchdog::{DataEvent, Watchdog, WatchdogVerdict};

use statistics::StatsRecorder;
use watchdog::WatchdogMonitor;

static NEXT_SCAN_NUMBER: AtomicU64 = AtomicU64::new(1);

// =============================================================================
// State & outcome
// =============================================================================

/// Scan state.
///
/// Ordered: a state compares greater than every state it can follow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ScanState {
    /// Created, not run
    Built,
    /// Presets and objects are being prepared
    Preparing,
    /// Points are being acquired
    Running,
    /// Started objects are being stopped
    Stopping,
    /// Finished normally (including a watchdog graceful stop)
    Done,
    /// Finished after a fault or an interrupt
    Faulted,
}

impl ScanState {
    /// True for `Done` and `Faulted`
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done | Self::Faulted)
    }
}

impl fmt::Display for ScanState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Built => write!(f, "BUILT"),
            Self::Preparing => write!(f, "PREPARING"),
            Self::Running => write!(f, "RUNNING"),
            Self::Stopping => write!(f, "STOPPING"),
            Self::Done => write!(f, "DONE"),
            Self::Faulted => write!(f, "FAULTED"),
        }
    }
}

/// How a run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ScanOutcome {
    /// All declared points acquired
    Completed,
    /// The watchdog asked to stop; collected data is valid
    GracefulStop,
    /// The operator interrupted the scan
    Interrupted,
    /// A device, preset or watchdog fault
    Faulted,
}

/// Result of [`Scan::run`].
///
/// Partial data stays queryable through [`Scan::data`] whatever the outcome.
#[derive(Debug)]
pub struct ScanReport {
    /// How the run ended
    pub outcome: ScanOutcome,
    /// Number of points whose start phase completed
    pub points: u64,
    /// Primary error, for `Interrupted` and `Faulted`
    pub error: Option<ScanError>,
    /// Errors raised while tearing down after the primary error
    pub suppressed: Vec<ScanError>,
    /// Call timing
    pub statistics: ScanStatistics,
}

impl ScanReport {
    /// True for `Completed` and `GracefulStop`
    pub fn is_success(&self) -> bool {
        matches!(self.outcome, ScanOutcome::Completed | ScanOutcome::GracefulStop)
    }

    /// Turn an unsuccessful report into its primary error
    pub fn into_result(mut self) -> ScanResult<Self> {
        if !self.is_success() {
            if let Some(err) = self.error.take() {
                return Err(err);
            }
        }
        Ok(self)
    }
}

/// Cloneable handle used to interrupt a running scan from another task.
#[derive(Debug, Clone)]
pub struct ScanInterruptHandle {
    tx: Arc<watch::Sender<bool>>,
}

impl ScanInterruptHandle {
    /// Request an interrupt; the scan unwinds and stops every started object
    pub fn interrupt(&self) {
        self.tx.send_replace(true);
    }

    /// True once an interrupt was requested
    pub fn is_interrupted(&self) -> bool {
        *self.tx.borrow()
    }
}

/// Lifecycle call issued to a whole level.
#[derive(Debug, Clone, Copy)]
enum Phase {
    WaitReady,
    Prepare,
    Start,
    Complete,
    Stop,
}

/// Why the point loop ended without an error.
enum LoopEnd {
    Exhausted,
    Graceful,
}

/// Phase-boundary bookkeeping needed to undo exactly what was done.
#[derive(Default)]
struct Progress {
    presets_prepared: usize,
    chain_presets_prepared: usize,
    iteration: Vec<Arc<dyn IterationPreset>>,
}

// =============================================================================
// Scan
// =============================================================================

/// Top-level scan session.
pub struct Scan {
    name: String,
    chain: AcquisitionChain,
    engine: EngineConfig,
    watchdog_period: Duration,
    presets: Vec<Arc<dyn ScanPreset>>,
    chain_presets: Vec<Arc<dyn ChainPreset>>,
    watchdog: Option<Arc<dyn Watchdog>>,
    state_tx: watch::Sender<ScanState>,
    interrupt_tx: Arc<watch::Sender<bool>>,
    running: AtomicBool,
    points: AtomicU64,
    stats: Arc<StatsRecorder>,
    info: RwLock<ScanInfo>,
}

impl fmt::Debug for Scan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Scan")
            .field("name", &self.name)
            .field("state", &self.state())
            .field("nodes", &self.chain.len())
            .finish()
    }
}

impl Scan {
    /// Create a scan over `chain`.
    ///
    /// The chain is validated immediately; a chain that was already run is
    /// rejected here as well as in [`run`](Self::run).
    pub fn new(name: impl Into<String>, chain: AcquisitionChain) -> ScanResult<Self> {
        chain.validate()?;
        if chain.is_consumed() {
            return Err(ScanError::ChainReused);
        }
        let name = name.into();
        let config = ScanConfig::default();
        let root = chain.root();
        let npoints = match root.discipline() {
            Some(Discipline::Continuous) => 1,
            _ => root.params().npoints,
        };
        let info = ScanInfo {
            uid: Uuid::new_v4(),
            scan_number: 0,
            name: name.clone(),
            title: name.clone(),
            npoints,
            chain: chain.describe(),
            start_time: None,
            end_time: None,
            state: ScanState::Built.to_string(),
            meta: ScanMeta::new(),
        };
        let (state_tx, _) = watch::channel(ScanState::Built);
        let (interrupt_tx, _) = watch::channel(false);

        Ok(Self {
            name,
            chain,
            engine: config.engine,
            watchdog_period: config.watchdog.timeout(),
            presets: Vec::new(),
            chain_presets: Vec::new(),
            watchdog: None,
            state_tx,
            interrupt_tx: Arc::new(interrupt_tx),
            running: AtomicBool::new(false),
            points: AtomicU64::new(0),
            stats: Arc::new(StatsRecorder::default()),
            info: RwLock::new(info),
        })
    }

    /// Set a human-readable title
    pub fn with_title(self, title: impl Into<String>) -> Self {
        self.info.write().title = title.into();
        self
    }

    /// Apply engine and watchdog settings
    pub fn with_config(mut self, config: &ScanConfig) -> Self {
        self.engine = config.engine.clone();
        self.watchdog_period = config.watchdog.timeout();
        self
    }

    /// Register a scan preset
    pub fn with_preset(mut self, preset: Arc<dyn ScanPreset>) -> Self {
        self.presets.push(preset);
        self
    }

    /// Register a chain preset
    pub fn with_chain_preset(mut self, preset: Arc<dyn ChainPreset>) -> Self {
        self.chain_presets.push(preset);
        self
    }

    /// Attach a watchdog
    pub fn with_watchdog(mut self, watchdog: Arc<dyn Watchdog>) -> Self {
        self.watchdog = Some(watchdog);
        self
    }

    /// Scan name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The chain this scan drives
    pub fn chain(&self) -> &AcquisitionChain {
        &self.chain
    }

    /// Current state
    pub fn state(&self) -> ScanState {
        *self.state_tx.borrow()
    }

    /// Receiver following state changes
    pub fn watch_state(&self) -> watch::Receiver<ScanState> {
        self.state_tx.subscribe()
    }

    /// Wait until the scan reaches `target` or any later state.
    ///
    /// Returns the state actually observed.
    pub async fn wait_state(&self, target: ScanState) -> ScanState {
        let mut rx = self.state_tx.subscribe();
        let observed = match rx.wait_for(|state| *state >= target).await {
            Ok(state) => *state,
            Err(_) => self.state(),
        };
        observed
    }

    /// Handle to interrupt the scan from another task
    pub fn interrupt_handle(&self) -> ScanInterruptHandle {
        ScanInterruptHandle {
            tx: self.interrupt_tx.clone(),
        }
    }

    /// Points whose start phase completed
    pub fn points(&self) -> u64 {
        self.points.load(Ordering::Acquire)
    }

    /// Metadata snapshot
    pub fn info(&self) -> ScanInfo {
        self.info.read().clone()
    }

    /// Call timing collected so far
    pub fn statistics(&self) -> ScanStatistics {
        self.stats.snapshot()
    }

    /// Data view over every channel in the chain
    pub fn data(&self) -> ScanData {
        ScanData::new(self.chain.channels())
    }

    fn set_state(&self, state: ScanState) {
        self.state_tx.send_replace(state);
        self.info.write().state = state.to_string();
        info!(scan = %self.name, %state, "scan state");
    }

    /// Run the scan.
    ///
    /// Returns `Err` only for structural and reuse errors, which are raised
    /// before any hardware call. Device faults, watchdog stops and interrupts
    /// are reported through [`ScanReport`].
    #[instrument(skip(self), fields(scan = %self.name))]
    pub async fn run(&self) -> ScanResult<ScanReport> {
        if self.running.swap(true, Ordering::AcqRel) {
            return Err(ScanError::ScanReused(self.name.clone()));
        }
        self.chain.validate()?;
        self.chain.consume()?;

        let run = RunContext::new(
            self.chain.clone(),
            self.stats.clone(),
            self.engine.call_timeout(),
        );
        let monitor = self.watchdog.clone().map(|watchdog| {
            WatchdogMonitor::new(watchdog, self.watchdog_period, self.chain.channels())
        });
        let continuous = self.chain.root().discipline() == Some(Discipline::Continuous);

        self.begin_info();
        self.set_state(ScanState::Preparing);

        let mut progress = Progress::default();
        let result = {
            let body = self.drive(&run, monitor.as_ref(), &mut progress);
            let watchdog_timeouts = async {
                match &monitor {
                    Some(monitor) => monitor.timeouts().await,
                    None => std::future::pending().await,
                }
            };
            // a continuous segment is a single point, so its data is followed live
            let live_data = async {
                match &monitor {
                    Some(monitor) if continuous => monitor.follow_data(|| self.info()).await,
                    _ => std::future::pending().await,
                }
            };
            tokio::select! {
                result = body => result,
                _ = self.interrupted() => Err(ScanError::Interrupted),
                verdict = watchdog_timeouts => {
                    Self::check_verdict(verdict).map(|end| end.unwrap_or(LoopEnd::Graceful))
                }
                verdict = live_data => {
                    Self::check_verdict(verdict).map(|end| end.unwrap_or(LoopEnd::Graceful))
                }
            }
        };

        let (mut outcome, mut primary) = match result {
            Ok(LoopEnd::Exhausted) => (ScanOutcome::Completed, None),
            Ok(LoopEnd::Graceful) => (ScanOutcome::GracefulStop, None),
            Err(ScanError::Interrupted) => (ScanOutcome::Interrupted, Some(ScanError::Interrupted)),
            Err(e) => (ScanOutcome::Faulted, Some(e)),
        };
        if let Some(err) = &primary {
            warn!(scan = %self.name, error = %err, "unwinding scan");
        }

        self.set_state(ScanState::Stopping);
        let mut teardown = self.teardown(&run, &mut progress).await;
        teardown.extend(run.take_suppressed());

        if primary.is_none() && !teardown.is_empty() {
            outcome = ScanOutcome::Faulted;
            primary = Some(teardown.remove(0));
        }

        for channel in self.chain.channels() {
            channel.seal();
        }

        let final_state = match outcome {
            ScanOutcome::Completed | ScanOutcome::GracefulStop => ScanState::Done,
            ScanOutcome::Interrupted | ScanOutcome::Faulted => ScanState::Faulted,
        };
        self.end_info(final_state);
        if let Some(monitor) = &monitor {
            monitor.scan_end(&self.info()).await;
        }
        self.set_state(final_state);

        let points = self.points();
        match &primary {
            None => info!(scan = %self.name, points, ?outcome, "scan finished"),
            Some(err) => error!(
                scan = %self.name,
                points,
                ?outcome,
                error = %err,
                suppressed = teardown.len(),
                "scan ended with error"
            ),
        }

        Ok(ScanReport {
            outcome,
            points,
            error: primary,
            suppressed: teardown,
            statistics: self.stats.snapshot(),
        })
    }

    async fn interrupted(&self) {
        let mut rx = self.interrupt_tx.subscribe();
        if rx.wait_for(|interrupted| *interrupted).await.is_err() {
            std::future::pending::<()>().await;
        }
    }

    fn begin_info(&self) {
        let mut meta = ScanMeta::new();
        for node in self.chain.nodes() {
            node.fill_meta_at_scan_init(&mut meta);
        }
        let mut info = self.info.write();
        info.scan_number = NEXT_SCAN_NUMBER.fetch_add(1, Ordering::Relaxed);
        info.start_time = Some(chrono::Utc::now());
        info.meta = meta;
    }

    fn end_info(&self, state: ScanState) {
        let mut meta = self.info.read().meta.clone();
        for node in self.chain.nodes() {
            node.fill_meta_at_scan_end(&mut meta);
        }
        let mut info = self.info.write();
        info.end_time = Some(chrono::Utc::now());
        info.state = state.to_string();
        info.meta = meta;
    }

    fn check_verdict(verdict: WatchdogVerdict) -> ScanResult<Option<LoopEnd>> {
        match verdict {
            WatchdogVerdict::Continue => Ok(None),
            WatchdogVerdict::GracefulStop => Ok(Some(LoopEnd::Graceful)),
            WatchdogVerdict::Fault(reason) => Err(ScanError::Watchdog(reason)),
        }
    }

    /// Issue `phase` on every node of `level` concurrently and wait for all.
    async fn level(
        &self,
        run: &RunContext,
        level: &[AcqNode],
        phase: Phase,
        point: u64,
    ) -> ScanResult<()> {
        let calls = level.iter().map(|node| -> BoxFuture<'_, ScanResult<()>> {
            match phase {
                Phase::WaitReady => Box::pin(node.wait_ready(run)),
                Phase::Prepare => Box::pin(node.prepare(run, point)),
                Phase::Start => Box::pin(node.start(run, point)),
                Phase::Complete => Box::pin(node.complete(run)),
                Phase::Stop => Box::pin(node.stop(run)),
            }
        });
        barrier::wait_all(calls).await.map(|_| ()).map_err(|failure| {
            for err in failure.suppressed {
                run.suppress(err);
            }
            failure.primary
        })
    }

    /// Run `phase` level by level from the root down.
    async fn top_down(&self, run: &RunContext, levels: &[Vec<AcqNode>], phase: Phase) -> ScanResult<()> {
        for level in levels {
            self.level(run, level, phase, 0).await?;
        }
        Ok(())
    }

    async fn drive(
        &self,
        run: &RunContext,
        monitor: Option<&WatchdogMonitor>,
        progress: &mut Progress,
    ) -> ScanResult<LoopEnd> {
        if let Some(monitor) = monitor {
            if let Some(end) = Self::check_verdict(monitor.scan_new(&self.info()).await)? {
                return Ok(end);
            }
        }

        for preset in &self.presets {
            progress.presets_prepared += 1;
            preset.prepare(self).await.map_err(|source| ScanError::Preset {
                phase: PresetPhase::Prepare,
                source,
            })?;
        }
        for preset in &self.chain_presets {
            progress.chain_presets_prepared += 1;
            preset
                .prepare(&self.chain)
                .await
                .map_err(|source| ScanError::Preset {
                    phase: PresetPhase::Prepare,
                    source,
                })?;
        }

        let root = self.chain.root();
        let continuous = root.discipline() == Some(Discipline::Continuous);
        let npoints = if continuous { 1 } else { root.params().npoints };
        let levels = self.chain.levels();
        let mut point: u64 = 0;
        let mut end = LoopEnd::Exhausted;

        while npoints == 0 || point < npoints {
            self.top_down(run, &levels, Phase::WaitReady).await?;

            for preset in self
                .chain_presets
                .iter()
                .filter_map(|preset| preset.iteration(point))
            {
                progress.iteration.push(preset.clone());
                preset.prepare().await.map_err(|source| ScanError::Preset {
                    phase: PresetPhase::Prepare,
                    source,
                })?;
            }
            if self.engine.parallel_prepare {
                let all: Vec<AcqNode> = levels.iter().flatten().cloned().collect();
                self.level(run, &all, Phase::Prepare, point).await?;
            } else {
                for level in &levels {
                    self.level(run, level, Phase::Prepare, point).await?;
                }
            }

            if point == 0 {
                self.start_presets().await?;
                self.set_state(ScanState::Running);
            }
            for preset in &progress.iteration {
                preset.start().await.map_err(|source| ScanError::Preset {
                    phase: PresetPhase::Start,
                    source,
                })?;
            }

            for level in levels.iter().rev() {
                self.level(run, level, Phase::Start, point).await?;
            }

            for preset in std::mem::take(&mut progress.iteration) {
                preset.stop().await.map_err(|source| ScanError::Preset {
                    phase: PresetPhase::Stop,
                    source,
                })?;
            }

            point += 1;
            self.points.store(point, Ordering::Release);
            debug!(scan = %self.name, point, "point acquired");

            if let Some(monitor) = monitor {
                if let Some(stop) = Self::check_verdict(monitor.checkpoint(&self.info()).await)? {
                    end = stop;
                    break;
                }
            }
        }

        if continuous {
            let limit = self.engine.continuous_timeout();
            tokio::time::timeout(limit, self.top_down(run, &levels, Phase::Complete))
                .await
                .map_err(|_| ScanError::Timeout {
                    object: root.name().to_string(),
                    operation: Operation::WaitReady,
                    timeout: limit,
                })??;
        } else {
            self.top_down(run, &levels, Phase::Complete).await?;
        }

        if let (Some(monitor), LoopEnd::Exhausted) = (monitor, &end) {
            if let Some(stop) = Self::check_verdict(monitor.checkpoint(&self.info()).await)? {
                end = stop;
            }
        }
        Ok(end)
    }

    async fn start_presets(&self) -> ScanResult<()> {
        for preset in &self.presets {
            preset.start(self).await.map_err(|source| ScanError::Preset {
                phase: PresetPhase::Start,
                source,
            })?;
        }
        for preset in &self.chain_presets {
            preset
                .start(&self.chain)
                .await
                .map_err(|source| ScanError::Preset {
                    phase: PresetPhase::Start,
                    source,
                })?;
        }
        Ok(())
    }

    /// Stop everything that was started, leaves first, then undo presets.
    ///
    /// Never short-circuits; every error is collected.
    async fn teardown(&self, run: &RunContext, progress: &mut Progress) -> Vec<ScanError> {
        let mut errors = Vec::new();
        let preset_error = |source| ScanError::Preset {
            phase: PresetPhase::Stop,
            source,
        };

        for preset in std::mem::take(&mut progress.iteration) {
            if let Err(source) = preset.stop().await {
                errors.push(preset_error(source));
            }
        }

        for level in self.chain.levels().iter().rev() {
            let started: Vec<AcqNode> = level
                .iter()
                .filter(|node| node.was_started())
                .cloned()
                .collect();
            if let Err(err) = self.level(run, &started, Phase::Stop, 0).await {
                errors.push(err);
                errors.extend(run.take_suppressed());
            }
        }

        for preset in self.chain_presets.iter().take(progress.chain_presets_prepared).rev() {
            if let Err(source) = preset.stop(&self.chain).await {
                errors.push(preset_error(source));
            }
        }
        for preset in self.presets.iter().take(progress.presets_prepared).rev() {
            if let Err(source) = preset.stop(self).await {
                errors.push(preset_error(source));
            }
        }
        errors
    }
}
