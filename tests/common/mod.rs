//! Instrumented fake acquisition objects shared by the integration tests.
//!
//! Every lifecycle call is recorded in a [`Journal`] with a begin and an end
//! (or failure) edge, so tests can assert on global call ordering.

#![allow(dead_code, clippy::unwrap_used, clippy::expect_used)]

use anyhow::{bail, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use daq_scan::{
    AcqNode, AcquisitionMaster, AcquisitionParams, AcquisitionSlave, Channel, Discipline,
    SlaveGroup,
};

// =============================================================================
// Journal
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Edge {
    Begin,
    End,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Entry {
    pub object: String,
    pub op: &'static str,
    pub edge: Edge,
}

#[derive(Debug, Default)]
pub struct Journal {
    entries: Mutex<Vec<Entry>>,
}

impl Journal {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn record(&self, object: &str, op: &'static str, edge: Edge) {
        self.entries.lock().push(Entry {
            object: object.to_string(),
            op,
            edge,
        });
    }

    pub fn entries(&self) -> Vec<Entry> {
        self.entries.lock().clone()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    /// `(object, op)` of every call, in the order the calls began
    pub fn calls(&self) -> Vec<(String, &'static str)> {
        self.entries
            .lock()
            .iter()
            .filter(|e| e.edge == Edge::Begin)
            .map(|e| (e.object.clone(), e.op))
            .collect()
    }

    /// Objects that began `op`, in order
    pub fn callers_of(&self, op: &str) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter(|(_, o)| *o == op)
            .map(|(object, _)| object)
            .collect()
    }

    pub fn count(&self, object: &str, op: &str) -> usize {
        self.calls()
            .iter()
            .filter(|(name, o)| name == object && *o == op)
            .count()
    }

    pub fn first(&self, object: &str, op: &str, edge: Edge) -> Option<usize> {
        self.entries
            .lock()
            .iter()
            .position(|e| e.object == object && e.op == op && e.edge == edge)
    }

    pub fn last(&self, object: &str, op: &str, edge: Edge) -> Option<usize> {
        self.entries
            .lock()
            .iter()
            .rposition(|e| e.object == object && e.op == op && e.edge == edge)
    }

    /// Position of the first entry of `object`, any op
    pub fn first_of(&self, object: &str) -> Option<usize> {
        self.entries.lock().iter().position(|e| e.object == object)
    }

    /// Position of the last entry of `object`, any op
    pub fn last_of(&self, object: &str) -> Option<usize> {
        self.entries.lock().iter().rposition(|e| e.object == object)
    }
}

// =============================================================================
// Scripted behaviour
// =============================================================================

#[derive(Debug, Clone, Copy)]
enum Misbehaviour {
    Fail,
    Hang(Duration),
}

/// Call recording with scripted failures on the n-th call (1-based) of an op.
struct Script {
    name: String,
    journal: Arc<Journal>,
    rules: Vec<(&'static str, u32, Misbehaviour)>,
    delays: HashMap<&'static str, Duration>,
    calls: Mutex<HashMap<&'static str, u32>>,
}

impl Script {
    fn new(name: &str, journal: Arc<Journal>) -> Self {
        Self {
            name: name.to_string(),
            journal,
            rules: Vec::new(),
            delays: HashMap::new(),
            calls: Mutex::new(HashMap::new()),
        }
    }

    /// Record the begin edge, then apply delays and scripted failures.
    /// Returns the call number.
    async fn enter(&self, op: &'static str) -> Result<u32> {
        self.journal.record(&self.name, op, Edge::Begin);
        let call = {
            let mut calls = self.calls.lock();
            let n = calls.entry(op).or_insert(0);
            *n += 1;
            *n
        };
        if let Some(delay) = self.delays.get(op) {
            tokio::time::sleep(*delay).await;
        }
        for (rule_op, rule_call, behaviour) in &self.rules {
            if *rule_op != op || *rule_call != call {
                continue;
            }
            match behaviour {
                Misbehaviour::Fail => {
                    self.journal.record(&self.name, op, Edge::Failed);
                    bail!("{} {} failed on call {}", self.name, op, call);
                }
                Misbehaviour::Hang(duration) => tokio::time::sleep(*duration).await,
            }
        }
        Ok(call)
    }

    fn leave(&self, op: &'static str) {
        self.journal.record(&self.name, op, Edge::End);
    }

    async fn simple(&self, op: &'static str) -> Result<u32> {
        let call = self.enter(op).await?;
        self.leave(op);
        Ok(call)
    }
}

// =============================================================================
// FakeSlave
// =============================================================================

/// Slave that emits its trigger call number into a channel named after it.
///
/// With [`with_reading`](FakeSlave::with_reading) its reading task emits a
/// fixed number of samples at a fixed interval, like a hardware-triggered
/// detector publishing during a segment.
pub struct FakeSlave {
    script: Script,
    channel: Channel,
    params: AcquisitionParams,
    reading: Option<(usize, Duration)>,
}

impl FakeSlave {
    pub fn new(name: &str, journal: &Arc<Journal>) -> Self {
        Self {
            script: Script::new(name, journal.clone()),
            channel: Channel::scalar(name),
            params: AcquisitionParams::default(),
            reading: None,
        }
    }

    pub fn with_reading(mut self, samples: usize, interval: Duration) -> Self {
        self.reading = Some((samples, interval));
        self
    }

    pub fn fail_on(mut self, op: &'static str, call: u32) -> Self {
        self.script.rules.push((op, call, Misbehaviour::Fail));
        self
    }

    pub fn hang_on(mut self, op: &'static str, call: u32, duration: Duration) -> Self {
        self.script.rules.push((op, call, Misbehaviour::Hang(duration)));
        self
    }

    pub fn with_delay(mut self, op: &'static str, delay: Duration) -> Self {
        self.script.delays.insert(op, delay);
        self
    }

    pub fn with_params(mut self, params: AcquisitionParams) -> Self {
        self.params = params;
        self
    }

    pub fn channel(&self) -> Channel {
        self.channel.clone()
    }

    pub fn node(self) -> AcqNode {
        AcqNode::slave(self)
    }
}

#[async_trait]
impl AcquisitionSlave for FakeSlave {
    fn name(&self) -> &str {
        &self.script.name
    }

    fn params(&self) -> AcquisitionParams {
        self.params.clone()
    }

    fn channels(&self) -> Vec<Channel> {
        vec![self.channel.clone()]
    }

    async fn wait_ready(&self) -> Result<()> {
        self.script.simple("wait_ready").await.map(|_| ())
    }

    async fn prepare(&self) -> Result<()> {
        self.script.simple("prepare").await.map(|_| ())
    }

    async fn start(&self) -> Result<()> {
        self.script.simple("start").await.map(|_| ())
    }

    async fn trigger(&self) -> Result<()> {
        let call = self.script.enter("trigger").await?;
        self.channel.emit(&[call as f64])?;
        self.script.leave("trigger");
        Ok(())
    }

    async fn reading(&self) -> Result<()> {
        let Some((samples, interval)) = self.reading else {
            return Ok(());
        };
        self.script.enter("reading").await?;
        for sample in 0..samples {
            tokio::time::sleep(interval).await;
            self.channel.emit(&[sample as f64])?;
        }
        self.script.leave("reading");
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        self.script.simple("stop").await.map(|_| ())
    }
}

// =============================================================================
// FakeMaster
// =============================================================================

/// Master emitting the point index into `<name>:point` before triggering its
/// children, then waiting for them.
///
/// As root it acquires in `start`; nested, it acquires when triggered. A
/// continuous master only arms in `start`.
pub struct FakeMaster {
    script: Script,
    channel: Channel,
    npoints: u64,
    discipline: Discipline,
    emits_hardware_trigger: bool,
}

impl FakeMaster {
    pub fn new(name: &str, npoints: u64, journal: &Arc<Journal>) -> Self {
        Self {
            script: Script::new(name, journal.clone()),
            channel: Channel::scalar(format!("{}:point", name)),
            npoints,
            discipline: Discipline::Step,
            emits_hardware_trigger: false,
        }
    }

    pub fn continuous(mut self) -> Self {
        self.discipline = Discipline::Continuous;
        self
    }

    pub fn with_hardware_trigger_output(mut self) -> Self {
        self.emits_hardware_trigger = true;
        self
    }

    pub fn fail_on(mut self, op: &'static str, call: u32) -> Self {
        self.script.rules.push((op, call, Misbehaviour::Fail));
        self
    }

    pub fn hang_on(mut self, op: &'static str, call: u32, duration: Duration) -> Self {
        self.script.rules.push((op, call, Misbehaviour::Hang(duration)));
        self
    }

    pub fn with_delay(mut self, op: &'static str, delay: Duration) -> Self {
        self.script.delays.insert(op, delay);
        self
    }

    pub fn channel(&self) -> Channel {
        self.channel.clone()
    }

    pub fn node(self) -> AcqNode {
        AcqNode::master(self)
    }

    async fn acquire(&self, slaves: &SlaveGroup<'_>) -> Result<()> {
        self.channel.emit(&[slaves.point() as f64])?;
        slaves.trigger_slaves().await?;
        slaves.wait_slaves().await?;
        Ok(())
    }
}

#[async_trait]
impl AcquisitionMaster for FakeMaster {
    fn name(&self) -> &str {
        &self.script.name
    }

    fn params(&self) -> AcquisitionParams {
        AcquisitionParams::new(self.npoints)
    }

    fn channels(&self) -> Vec<Channel> {
        vec![self.channel.clone()]
    }

    fn discipline(&self) -> Discipline {
        self.discipline
    }

    fn emits_hardware_trigger(&self) -> bool {
        self.emits_hardware_trigger
    }

    async fn wait_ready(&self) -> Result<()> {
        self.script.simple("wait_ready").await.map(|_| ())
    }

    async fn prepare(&self) -> Result<()> {
        self.script.simple("prepare").await.map(|_| ())
    }

    async fn start(&self, slaves: &SlaveGroup<'_>) -> Result<()> {
        self.script.enter("start").await?;
        if slaves.is_root() && self.discipline == Discipline::Step {
            self.acquire(slaves).await?;
        }
        self.script.leave("start");
        Ok(())
    }

    async fn trigger(&self, slaves: &SlaveGroup<'_>) -> Result<()> {
        self.script.enter("trigger").await?;
        self.acquire(slaves).await?;
        self.script.leave("trigger");
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        self.script.simple("stop").await.map(|_| ())
    }
}
