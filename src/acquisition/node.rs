use anyhow::anyhow;
use futures::future::BoxFuture;
use futures::stream::{FuturesUnordered, StreamExt};
use parking_lot::Mutex;
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

use super::{
    AcquisitionMaster, AcquisitionParams, AcquisitionSlave, Discipline, ObjectState, TriggerType,
};
use crate::barrier;
use crate::chain::AcquisitionChain;
use crate::channel::Channel;
use crate::error::{Operation, ScanError, ScanResult};
use crate::scan::info::ScanMeta;
use crate::scan::statistics::StatsRecorder;

static NEXT_NODE_UID: AtomicU64 = AtomicU64::new(1);

const UNOWNED: u64 = 0;

// =============================================================================
// Run context
// =============================================================================

/// State shared by every lifecycle call of one scan run.
pub(crate) struct RunContext {
    pub(crate) chain: AcquisitionChain,
    pub(crate) stats: Arc<StatsRecorder>,
    pub(crate) call_timeout: Option<Duration>,
    suppressed: Mutex<Vec<ScanError>>,
}

impl RunContext {
    pub(crate) fn new(
        chain: AcquisitionChain,
        stats: Arc<StatsRecorder>,
        call_timeout: Option<Duration>,
    ) -> Self {
        Self {
            chain,
            stats,
            call_timeout,
            suppressed: Mutex::new(Vec::new()),
        }
    }

    /// Keep a secondary error raised while tearing down after a fault.
    pub(crate) fn suppress(&self, err: ScanError) {
        warn!(error = %err, "secondary error during teardown");
        self.suppressed.lock().push(err);
    }

    pub(crate) fn take_suppressed(&self) -> Vec<ScanError> {
        std::mem::take(&mut *self.suppressed.lock())
    }
}

// =============================================================================
// AcqNode
// =============================================================================

enum Role {
    Slave(Arc<dyn AcquisitionSlave>),
    Master(Arc<dyn AcquisitionMaster>),
}

/// Spawned `reading` task of a slave. Aborted if dropped before it is joined.
#[derive(Debug)]
struct ReadingTask(JoinHandle<anyhow::Result<()>>);

impl ReadingTask {
    fn is_finished(&self) -> bool {
        self.0.is_finished()
    }

    async fn join(mut self) -> anyhow::Result<()> {
        match (&mut self.0).await {
            Ok(result) => result,
            Err(e) if e.is_panic() => Err(anyhow!("reading task panicked")),
            Err(e) => Err(anyhow!("reading task ended abnormally: {}", e)),
        }
    }
}

impl Drop for ReadingTask {
    fn drop(&mut self) {
        self.0.abort();
    }
}

#[derive(Debug, Default)]
struct NodeRuntime {
    state: ObjectState,
    // set when start is issued, so a cancelled or failed start still gets a stop
    armed: bool,
    stop_issued: bool,
    stop_count: u32,
    reading: Option<ReadingTask>,
}

struct NodeInner {
    uid: u64,
    name: String,
    role: Role,
    params: AcquisitionParams,
    channels: Vec<Channel>,
    owner: AtomicU64,
    runtime: Mutex<NodeRuntime>,
}

/// Handle to an acquisition object placed in a chain.
///
/// Cloning is cheap; clones refer to the same object. A node can be added to
/// exactly one chain and is driven by exactly one scan run.
#[derive(Clone)]
pub struct AcqNode {
    inner: Arc<NodeInner>,
}

impl fmt::Debug for AcqNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AcqNode")
            .field("name", &self.inner.name)
            .field("master", &self.is_master())
            .field("state", &self.state())
            .finish()
    }
}

impl AcqNode {
    fn from_role(role: Role) -> Self {
        let (name, params, channels) = match &role {
            Role::Slave(s) => (s.name().to_string(), s.params(), s.channels()),
            Role::Master(m) => (m.name().to_string(), m.params(), m.channels()),
        };
        Self {
            inner: Arc::new(NodeInner {
                uid: NEXT_NODE_UID.fetch_add(1, Ordering::Relaxed),
                name,
                role,
                params,
                channels,
                owner: AtomicU64::new(UNOWNED),
                runtime: Mutex::new(NodeRuntime::default()),
            }),
        }
    }

    /// Wrap a slave
    pub fn slave<S: AcquisitionSlave + 'static>(slave: S) -> Self {
        Self::from_slave(Arc::new(slave))
    }

    /// Wrap a shared slave
    pub fn from_slave(slave: Arc<dyn AcquisitionSlave>) -> Self {
        Self::from_role(Role::Slave(slave))
    }

    /// Wrap a master
    pub fn master<M: AcquisitionMaster + 'static>(master: M) -> Self {
        Self::from_master(Arc::new(master))
    }

    /// Wrap a shared master
    pub fn from_master(master: Arc<dyn AcquisitionMaster>) -> Self {
        Self::from_role(Role::Master(master))
    }

    /// Object name
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Parameters captured when the node was created
    pub fn params(&self) -> &AcquisitionParams {
        &self.inner.params
    }

    /// Channels owned by the object
    pub fn channels(&self) -> &[Channel] {
        &self.inner.channels
    }

    /// True for masters
    pub fn is_master(&self) -> bool {
        matches!(self.inner.role, Role::Master(_))
    }

    /// Timing discipline, for masters
    pub fn discipline(&self) -> Option<Discipline> {
        match &self.inner.role {
            Role::Master(m) => Some(m.discipline()),
            Role::Slave(_) => None,
        }
    }

    /// Current per-run state
    pub fn state(&self) -> ObjectState {
        self.inner.runtime.lock().state
    }

    /// Number of `stop` calls issued to the object
    pub fn stop_count(&self) -> u32 {
        self.inner.runtime.lock().stop_count
    }

    /// True when both handles refer to the same object
    pub fn ptr_eq(&self, other: &AcqNode) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    pub(crate) fn uid(&self) -> u64 {
        self.inner.uid
    }

    pub(crate) fn owner(&self) -> Option<u64> {
        match self.inner.owner.load(Ordering::Acquire) {
            UNOWNED => None,
            id => Some(id),
        }
    }

    /// Bind the node to a chain. Fails if another chain owns it.
    pub(crate) fn claim(&self, chain_id: u64) -> bool {
        match self.inner.owner.compare_exchange(
            UNOWNED,
            chain_id,
            Ordering::AcqRel,
            Ordering::Acquire,
        ) {
            Ok(_) => true,
            Err(current) => current == chain_id,
        }
    }

    /// True when the object can only be driven by a hardware signal
    pub(crate) fn requires_hardware_trigger(&self) -> bool {
        self.inner.params.trigger_type == TriggerType::Hardware
            || self.discipline() == Some(Discipline::Continuous)
    }

    pub(crate) fn emits_hardware_trigger(&self) -> bool {
        match &self.inner.role {
            Role::Master(m) => {
                m.emits_hardware_trigger() || m.discipline() == Discipline::Continuous
            }
            Role::Slave(_) => false,
        }
    }

    pub(crate) fn fill_meta_at_scan_init(&self, meta: &mut ScanMeta) {
        match &self.inner.role {
            Role::Slave(s) => s.fill_meta_at_scan_init(meta),
            Role::Master(m) => m.fill_meta_at_scan_init(meta),
        }
    }

    pub(crate) fn fill_meta_at_scan_end(&self, meta: &mut ScanMeta) {
        match &self.inner.role {
            Role::Slave(s) => s.fill_meta_at_scan_end(meta),
            Role::Master(m) => m.fill_meta_at_scan_end(meta),
        }
    }

    fn set_state(&self, state: ObjectState) {
        let mut runtime = self.inner.runtime.lock();
        if runtime.state != ObjectState::Faulted {
            runtime.state = state;
        }
    }

    fn fault(&self) {
        self.inner.runtime.lock().state = ObjectState::Faulted;
    }

    fn ensure_not_faulted(&self, operation: Operation) -> ScanResult<()> {
        if self.state() == ObjectState::Faulted {
            return Err(ScanError::ObjectFaulted {
                object: self.inner.name.clone(),
                operation,
            });
        }
        Ok(())
    }

    /// Run one lifecycle call: timeout, statistics, logging and fault tracking.
    async fn invoke<F>(&self, run: &RunContext, operation: Operation, call: F) -> ScanResult<()>
    where
        F: Future<Output = anyhow::Result<()>> + Send,
    {
        let name = self.inner.name.as_str();
        let timeout = self.inner.params.timeout.or(run.call_timeout);
        debug!(object = name, %operation, "call");

        let started = Instant::now();
        let result = match timeout {
            Some(limit) => match tokio::time::timeout(limit, call).await {
                Ok(r) => r.map_err(|e| ScanError::device(name, operation, e)),
                Err(_) => Err(ScanError::Timeout {
                    object: name.to_string(),
                    operation,
                    timeout: limit,
                }),
            },
            None => call.await.map_err(|e| ScanError::device(name, operation, e)),
        };
        let elapsed = started.elapsed();
        run.stats.record(name, operation.as_str(), elapsed);

        match &result {
            Ok(()) => debug!(object = name, %operation, ?elapsed, "done"),
            Err(e) => {
                // A child's fault surfacing through this master leaves the master healthy.
                if e.object().map_or(true, |object| object == name) {
                    self.fault();
                }
                error!(object = name, %operation, error = %e, "call failed");
            }
        }
        result
    }

    pub(crate) async fn wait_ready(&self, run: &RunContext) -> ScanResult<()> {
        self.ensure_not_faulted(Operation::WaitReady)?;
        let call = match &self.inner.role {
            Role::Slave(s) => s.wait_ready(),
            Role::Master(m) => m.wait_ready(),
        };
        self.invoke(run, Operation::WaitReady, call).await?;
        let mut runtime = self.inner.runtime.lock();
        if matches!(runtime.state, ObjectState::Created | ObjectState::Stopped) {
            runtime.state = ObjectState::Ready;
        }
        Ok(())
    }

    pub(crate) async fn prepare(&self, run: &RunContext, point: u64) -> ScanResult<()> {
        if point > 0 && self.inner.params.prepare_once {
            return Ok(());
        }
        self.ensure_not_faulted(Operation::Prepare)?;
        let call = match &self.inner.role {
            Role::Slave(s) => s.prepare(),
            Role::Master(m) => m.prepare(),
        };
        self.invoke(run, Operation::Prepare, call).await?;
        self.set_state(ObjectState::Prepared);
        Ok(())
    }

    pub(crate) async fn start(&self, run: &RunContext, point: u64) -> ScanResult<()> {
        if point > 0 && self.inner.params.start_once {
            return Ok(());
        }
        self.ensure_not_faulted(Operation::Start)?;
        self.inner.runtime.lock().armed = true;
        match &self.inner.role {
            Role::Slave(s) => {
                self.invoke(run, Operation::Start, s.start()).await?;
                self.spawn_reading(run, s).await?;
            }
            Role::Master(m) => {
                let slaves = SlaveGroup::new(run, self, point);
                self.invoke(run, Operation::Start, m.start(&slaves)).await?
            }
        }
        self.set_state(ObjectState::Started);
        Ok(())
    }

    pub(crate) async fn trigger(&self, run: &RunContext, point: u64) -> ScanResult<()> {
        self.ensure_not_faulted(Operation::Trigger)?;
        match &self.inner.role {
            Role::Slave(s) => self.invoke(run, Operation::Trigger, s.trigger()).await?,
            Role::Master(m) => {
                let slaves = SlaveGroup::new(run, self, point);
                self.invoke(run, Operation::Trigger, m.trigger(&slaves)).await?
            }
        }
        self.set_state(ObjectState::Triggered);
        Ok(())
    }

    /// Spawn the slave's reading task unless one is still running.
    ///
    /// A task that already finished is joined first so its error surfaces.
    async fn spawn_reading(&self, run: &RunContext, slave: &Arc<dyn AcquisitionSlave>) -> ScanResult<()> {
        let finished = {
            let mut runtime = self.inner.runtime.lock();
            if runtime.reading.as_ref().is_some_and(|task| !task.is_finished()) {
                return Ok(());
            }
            runtime.reading.take()
        };
        if let Some(task) = finished {
            self.invoke(run, Operation::Reading, task.join()).await?;
        }
        let slave = slave.clone();
        let handle = tokio::spawn(async move { slave.reading().await });
        self.inner.runtime.lock().reading = Some(ReadingTask(handle));
        Ok(())
    }

    /// Join the reading task, if one was spawned.
    pub(crate) async fn wait_reading(&self, run: &RunContext) -> ScanResult<()> {
        let task = self.inner.runtime.lock().reading.take();
        match task {
            Some(task) => self.invoke(run, Operation::Reading, task.join()).await,
            None => Ok(()),
        }
    }

    /// Completion pass at the end of a run: join the reading task, then wait
    /// until the device is ready.
    pub(crate) async fn complete(&self, run: &RunContext) -> ScanResult<()> {
        self.wait_reading(run).await?;
        self.wait_ready(run).await
    }

    /// Issue `stop` if the object was started and has not been stopped yet.
    ///
    /// Faulted objects get this single forced attempt. A reading task that
    /// is still running afterwards is aborted; one that already failed is
    /// kept as a secondary error. Channels are sealed once the call
    /// returns, whatever its outcome.
    pub(crate) async fn stop(&self, run: &RunContext) -> ScanResult<()> {
        {
            let mut runtime = self.inner.runtime.lock();
            if !runtime.armed || runtime.stop_issued {
                return Ok(());
            }
            runtime.stop_issued = true;
            runtime.stop_count += 1;
        }
        let call = match &self.inner.role {
            Role::Slave(s) => s.stop(),
            Role::Master(m) => m.stop(),
        };
        let result = self.invoke(run, Operation::Stop, call).await;

        let reading = self.inner.runtime.lock().reading.take();
        if let Some(task) = reading {
            if task.is_finished() {
                if let Err(e) = task.join().await {
                    run.suppress(ScanError::device(self.name(), Operation::Reading, e));
                }
            } else {
                debug!(object = self.name(), "reading task aborted");
            }
        }

        for channel in &self.inner.channels {
            channel.seal();
        }
        if result.is_ok() {
            self.set_state(ObjectState::Stopped);
        }
        result
    }

    pub(crate) fn was_started(&self) -> bool {
        self.inner.runtime.lock().armed
    }
}

// =============================================================================
// SlaveGroup
// =============================================================================

/// The direct children of a master, handed to its `start` and `trigger`.
pub struct SlaveGroup<'a> {
    run: &'a RunContext,
    master: &'a AcqNode,
    children: Vec<AcqNode>,
    point: u64,
}

impl<'a> SlaveGroup<'a> {
    fn new(run: &'a RunContext, master: &'a AcqNode, point: u64) -> Self {
        Self {
            run,
            master,
            children: run.chain.children_of(master),
            point,
        }
    }

    /// Index of the current scan point (0-based)
    pub fn point(&self) -> u64 {
        self.point
    }

    /// True when the master is the chain root, so no parent will trigger it
    pub fn is_root(&self) -> bool {
        self.run.chain.root().ptr_eq(self.master)
    }

    /// Children in insertion order
    pub fn children(&self) -> &[AcqNode] {
        &self.children
    }

    /// Number of children
    pub fn len(&self) -> usize {
        self.children.len()
    }

    /// True when the master has no children
    pub fn is_empty(&self) -> bool {
        self.children.is_empty()
    }

    /// Trigger every software-triggered child and wait for the triggers to
    /// complete.
    ///
    /// Triggers are issued in insertion order and run concurrently. On the
    /// first failure the remaining triggers are cancelled, and every other
    /// child whose trigger was issued is stopped before the error is
    /// returned. Hardware-triggered children are skipped; they are driven by
    /// the signal and only waited on.
    pub async fn trigger_slaves(&self) -> ScanResult<()> {
        let started = Instant::now();
        let targets: Vec<&AcqNode> = self
            .children
            .iter()
            .filter(|child| child.params().trigger_type != TriggerType::Hardware)
            .collect();
        let issued: Vec<AtomicBool> = targets.iter().map(|_| AtomicBool::new(false)).collect();

        let mut failure = None;
        {
            let mut pending: FuturesUnordered<_> = targets
                .iter()
                .enumerate()
                .map(|(index, child)| {
                    let issued = &issued[index];
                    let call: BoxFuture<'_, (usize, ScanResult<()>)> = Box::pin(async move {
                        issued.store(true, Ordering::Release);
                        (index, child.trigger(self.run, self.point).await)
                    });
                    call
                })
                .collect();
            while let Some((index, result)) = pending.next().await {
                if let Err(e) = result {
                    failure = Some((index, e));
                    break;
                }
            }
        }

        let outcome = match failure {
            None => Ok(()),
            Some((failed, e)) => {
                let triggered: Vec<&AcqNode> = targets
                    .iter()
                    .zip(&issued)
                    .enumerate()
                    .filter(|(index, (_, issued))| {
                        *index != failed && issued.load(Ordering::Acquire)
                    })
                    .map(|(_, (child, _))| *child)
                    .collect();
                warn!(
                    master = self.master.name(),
                    child = targets[failed].name(),
                    stopping = triggered.len(),
                    "trigger failed, stopping triggered children"
                );
                for child in triggered.iter().rev() {
                    if let Err(stop_err) = child.stop(self.run).await {
                        self.run.suppress(stop_err);
                    }
                }
                Err(e)
            }
        };

        self.run.stats.record(
            self.master.name(),
            Operation::TriggerSlaves.as_str(),
            started.elapsed(),
        );
        outcome
    }

    /// Wait until every child reports ready (concurrently).
    ///
    /// The first failure is returned; later ones are kept as secondary errors.
    pub async fn wait_slaves(&self) -> ScanResult<()> {
        let started = Instant::now();
        let calls = self.children.iter().map(|child| {
            let call: BoxFuture<'_, ScanResult<()>> = Box::pin(child.wait_ready(self.run));
            call
        });
        let outcome = barrier::wait_all(calls).await;
        self.run.stats.record(
            self.master.name(),
            Operation::WaitSlaves.as_str(),
            started.elapsed(),
        );
        match outcome {
            Ok(_) => Ok(()),
            Err(failure) => {
                for err in failure.suppressed {
                    self.run.suppress(err);
                }
                Err(failure.primary)
            }
        }
    }
}
