//! Scan watchdog.
//!
//! A [`Watchdog`] observes a running scan and decides whether it may go on.
//! Callbacks return a [`WatchdogVerdict`] instead of raising: `GracefulStop`
//! ends the scan normally with the data collected so far, `Fault` unwinds it
//! like a device fault. A callback that panics is logged and treated as
//! `Continue`.
//!
//! In step scans data notifications are delivered at point boundaries: after
//! each point the engine reports every channel that grew since the previous
//! notification, so a graceful stop always lands on a whole point. Under a
//! continuous master the scan is a single segment, and the monitor follows
//! channel growth as it happens instead; growth that occurs while a callback
//! runs is batched into the next call. `on_timeout` fires when no channel
//! grew for a whole watchdog period.

use async_trait::async_trait;
use futures::future::select_all;
use futures::FutureExt;
use parking_lot::Mutex;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, warn};

use super::info::ScanInfo;
use crate::channel::Channel;

/// Decision returned by watchdog callbacks.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum WatchdogVerdict {
    /// Keep going
    #[default]
    Continue,
    /// End the scan normally; collected data stays valid
    GracefulStop,
    /// Abort the scan as faulted
    Fault(String),
}

/// Growth of one channel since the previous data notification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataEvent {
    /// Channel name
    pub channel: String,
    /// Length before the growth
    pub from: usize,
    /// Length after the growth
    pub new_length: usize,
}

/// Observer of a running scan
#[async_trait]
pub trait Watchdog: Send + Sync {
    /// Period after which `on_timeout` fires without data; `None` uses the
    /// configured default
    fn timeout(&self) -> Option<Duration> {
        None
    }

    /// The scan is about to prepare
    async fn on_scan_new(&self, _info: &ScanInfo) -> WatchdogVerdict {
        WatchdogVerdict::Continue
    }

    /// Channels grew
    async fn on_scan_data(&self, _events: &[DataEvent], _info: &ScanInfo) -> WatchdogVerdict {
        WatchdogVerdict::Continue
    }

    /// No data for a whole period
    async fn on_timeout(&self) -> WatchdogVerdict {
        WatchdogVerdict::Continue
    }

    /// The scan ended (any outcome)
    async fn on_scan_end(&self, _info: &ScanInfo) {}
}

/// Drives one watchdog for one scan run.
pub(crate) struct WatchdogMonitor {
    watchdog: Arc<dyn Watchdog>,
    period: Duration,
    channels: Vec<Channel>,
    reported: Mutex<Vec<usize>>,
    last_total: Mutex<usize>,
    // one on_scan_data call at a time, in growth order
    delivery: tokio::sync::Mutex<()>,
}

impl WatchdogMonitor {
    pub(crate) fn new(watchdog: Arc<dyn Watchdog>, default_period: Duration, channels: Vec<Channel>) -> Self {
        let period = watchdog.timeout().unwrap_or(default_period);
        let reported = channels.iter().map(Channel::len).collect();
        let last_total = channels.iter().map(Channel::len).sum();
        Self {
            watchdog,
            period,
            channels,
            reported: Mutex::new(reported),
            last_total: Mutex::new(last_total),
            delivery: tokio::sync::Mutex::new(()),
        }
    }

    async fn isolated<F>(callback: &'static str, call: F) -> WatchdogVerdict
    where
        F: Future<Output = WatchdogVerdict>,
    {
        match AssertUnwindSafe(call).catch_unwind().await {
            Ok(verdict) => verdict,
            Err(_) => {
                warn!(callback, "watchdog panicked, continuing");
                WatchdogVerdict::Continue
            }
        }
    }

    pub(crate) async fn scan_new(&self, info: &ScanInfo) -> WatchdogVerdict {
        Self::isolated("on_scan_new", self.watchdog.on_scan_new(info)).await
    }

    /// Report channels that grew since the last checkpoint.
    pub(crate) async fn checkpoint(&self, info: &ScanInfo) -> WatchdogVerdict {
        let _delivery = self.delivery.lock().await;
        let events: Vec<DataEvent> = {
            let mut reported = self.reported.lock();
            self.channels
                .iter()
                .zip(reported.iter_mut())
                .filter_map(|(channel, seen)| {
                    let len = channel.len();
                    (len > *seen).then(|| {
                        let event = DataEvent {
                            channel: channel.name().to_string(),
                            from: *seen,
                            new_length: len,
                        };
                        *seen = len;
                        event
                    })
                })
                .collect()
        };
        if events.is_empty() {
            return WatchdogVerdict::Continue;
        }
        debug!(channels = events.len(), "watchdog data checkpoint");
        Self::isolated("on_scan_data", self.watchdog.on_scan_data(&events, info)).await
    }

    /// Report channel growth as it happens.
    ///
    /// Resolves with the first non-`Continue` verdict from `on_scan_data`;
    /// never resolves when there are no channels.
    pub(crate) async fn follow_data<F>(&self, info: F) -> WatchdogVerdict
    where
        F: Fn() -> ScanInfo,
    {
        let mut lengths: Vec<watch::Receiver<usize>> =
            self.channels.iter().map(Channel::watch_len).collect();
        if lengths.is_empty() {
            return std::future::pending().await;
        }
        loop {
            match self.checkpoint(&info()).await {
                WatchdogVerdict::Continue => {}
                verdict => return verdict,
            }
            let grown = lengths.iter_mut().map(|rx| Box::pin(rx.changed()));
            if select_all(grown).await.0.is_err() {
                // the channel is gone; nothing more will grow
                return std::future::pending().await;
            }
        }
    }

    /// Resolves with the first non-`Continue` verdict from `on_timeout`.
    pub(crate) async fn timeouts(&self) -> WatchdogVerdict {
        loop {
            tokio::time::sleep(self.period).await;
            let total: usize = self.channels.iter().map(Channel::len).sum();
            {
                let mut last = self.last_total.lock();
                if total != *last {
                    *last = total;
                    continue;
                }
            }
            match Self::isolated("on_timeout", self.watchdog.on_timeout()).await {
                WatchdogVerdict::Continue => continue,
                verdict => return verdict,
            }
        }
    }

    pub(crate) async fn scan_end(&self, info: &ScanInfo) {
        if AssertUnwindSafe(self.watchdog.on_scan_end(info))
            .catch_unwind()
            .await
            .is_err()
        {
            warn!(callback = "on_scan_end", "watchdog panicked");
        }
    }
}
