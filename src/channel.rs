//! Append-only data channels.
//!
//! A [`Channel`] is a named, typed stream of samples owned by one acquisition
//! object. Producers call [`Channel::emit`] with contiguous batches; every
//! sample gets the next index and is immutable afterwards. Consumers either
//! register a callback with [`Channel::subscribe`] or pull with
//! [`Channel::get`], which never waits for future data.
//!
//! Samples are stored flat as `f64`. A sample of shape `[4, 2]` occupies eight
//! consecutive values; lengths and indices always count samples, not values.
//!
//! # Example
//!
//! ```rust,ignore
//! let diode = Channel::scalar("diode");
//! let id = diode.subscribe(|update| {
//!     println!("{} now has {} samples", update.name, update.new_length);
//!     Ok(())
//! });
//! diode.emit(&[0.1, 0.2])?;
//! assert_eq!(diode.get(0, 2)?, vec![0.1, 0.2]);
//! diode.unsubscribe(id);
//! ```

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::warn;

use crate::error::ChannelError;

/// Element data type declared by a channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DType {
    /// 64-bit float
    Float64,
    /// 32-bit float
    Float32,
    /// Signed 64-bit integer
    Int64,
    /// Signed 32-bit integer
    Int32,
    /// Unsigned 32-bit integer
    UInt32,
}

impl fmt::Display for DType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Float64 => "float64",
            Self::Float32 => "float32",
            Self::Int64 => "int64",
            Self::Int32 => "int32",
            Self::UInt32 => "uint32",
        };
        f.write_str(name)
    }
}

/// Notification delivered to subscribers after each emission.
#[derive(Debug, Clone, Copy)]
pub struct ChannelUpdate<'a> {
    /// Channel name
    pub name: &'a str,
    /// Number of samples after the emission
    pub new_length: usize,
    /// Values of the newly emitted samples
    pub data: Option<&'a [f64]>,
}

/// Handle returned by [`Channel::subscribe`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

type Callback = Arc<dyn Fn(&ChannelUpdate<'_>) -> anyhow::Result<()> + Send + Sync>;

struct ChannelInner {
    name: String,
    dtype: DType,
    shape: Vec<usize>,
    sample_size: usize,
    data: RwLock<Vec<f64>>,
    // Serializes append + notify so subscribers see emissions in index order.
    emit_lock: Mutex<()>,
    subscribers: Mutex<Vec<(SubscriptionId, Callback)>>,
    next_subscription: AtomicU64,
    len_tx: watch::Sender<usize>,
    sealed: AtomicBool,
}

/// Append-only, monotonically indexed data stream.
///
/// Cloning is cheap and yields another handle to the same stream.
#[derive(Clone)]
pub struct Channel {
    inner: Arc<ChannelInner>,
}

impl fmt::Debug for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Channel")
            .field("name", &self.inner.name)
            .field("dtype", &self.inner.dtype)
            .field("shape", &self.inner.shape)
            .field("len", &self.len())
            .field("sealed", &self.is_sealed())
            .finish()
    }
}

impl Channel {
    /// Create a channel whose samples have the given shape (`&[]` for scalars).
    pub fn new(name: impl Into<String>, dtype: DType, shape: &[usize]) -> Self {
        let (len_tx, _) = watch::channel(0);
        Self {
            inner: Arc::new(ChannelInner {
                name: name.into(),
                dtype,
                shape: shape.to_vec(),
                sample_size: shape.iter().product::<usize>().max(1),
                data: RwLock::new(Vec::new()),
                emit_lock: Mutex::new(()),
                subscribers: Mutex::new(Vec::new()),
                next_subscription: AtomicU64::new(0),
                len_tx,
                sealed: AtomicBool::new(false),
            }),
        }
    }

    /// Scalar `float64` channel
    pub fn scalar(name: impl Into<String>) -> Self {
        Self::new(name, DType::Float64, &[])
    }

    /// Channel name
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Declared element type
    pub fn dtype(&self) -> DType {
        self.inner.dtype
    }

    /// Shape of one sample (empty for scalars)
    pub fn shape(&self) -> &[usize] {
        &self.inner.shape
    }

    /// Number of values in one sample
    pub fn sample_size(&self) -> usize {
        self.inner.sample_size
    }

    /// Number of samples emitted so far
    pub fn len(&self) -> usize {
        self.inner.data.read().len() / self.inner.sample_size
    }

    /// True when nothing has been emitted
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// True once the owning object stopped
    pub fn is_sealed(&self) -> bool {
        self.inner.sealed.load(Ordering::Acquire)
    }

    /// Append a contiguous batch of samples and notify subscribers.
    ///
    /// `batch.len()` must be a multiple of [`sample_size`](Self::sample_size).
    /// Returns the new length in samples.
    pub fn emit(&self, batch: &[f64]) -> Result<usize, ChannelError> {
        let _guard = self.inner.emit_lock.lock();

        if self.is_sealed() {
            return Err(ChannelError::Sealed(self.inner.name.clone()));
        }
        if batch.len() % self.inner.sample_size != 0 {
            return Err(ChannelError::RaggedBatch {
                name: self.inner.name.clone(),
                sample_size: self.inner.sample_size,
                len: batch.len(),
            });
        }
        if batch.is_empty() {
            return Ok(self.len());
        }

        let new_length = {
            let mut data = self.inner.data.write();
            data.extend_from_slice(batch);
            data.len() / self.inner.sample_size
        };
        self.inner.len_tx.send_replace(new_length);

        let update = ChannelUpdate {
            name: &self.inner.name,
            new_length,
            data: Some(batch),
        };
        self.notify(&update);
        Ok(new_length)
    }

    fn notify(&self, update: &ChannelUpdate<'_>) {
        // Snapshot so a callback may (un)subscribe without deadlocking.
        let subscribers: Vec<(SubscriptionId, Callback)> = self.inner.subscribers.lock().clone();

        for (id, callback) in subscribers {
            match catch_unwind(AssertUnwindSafe(|| callback(update))) {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    warn!(channel = %update.name, subscription = id.0, error = %e, "subscriber failed");
                }
                Err(_) => {
                    warn!(channel = %update.name, subscription = id.0, "subscriber panicked");
                }
            }
        }
    }

    /// Register a live-update listener.
    ///
    /// Callbacks run on the emitting task while the channel's emission lock
    /// is held, which is what keeps deliveries in index order. A callback
    /// must therefore not call [`emit`](Self::emit) or [`seal`](Self::seal)
    /// on the same channel: that deadlocks. Reading with `get`, `len` or
    /// `values` and (un)subscribing are fine.
    pub fn subscribe<F>(&self, callback: F) -> SubscriptionId
    where
        F: Fn(&ChannelUpdate<'_>) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        let id = SubscriptionId(self.inner.next_subscription.fetch_add(1, Ordering::Relaxed));
        self.inner.subscribers.lock().push((id, Arc::new(callback)));
        id
    }

    /// Remove a listener. Returns false if it was not registered.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut subscribers = self.inner.subscribers.lock();
        let before = subscribers.len();
        subscribers.retain(|(sub, _)| *sub != id);
        subscribers.len() != before
    }

    /// Number of registered listeners
    pub fn subscriber_count(&self) -> usize {
        self.inner.subscribers.lock().len()
    }

    /// Values of samples `from..to`, clamped to what has been emitted.
    ///
    /// Never waits for future data.
    pub fn get(&self, from: usize, to: usize) -> Result<Vec<f64>, ChannelError> {
        if from > to {
            return Err(ChannelError::InvalidRange {
                name: self.inner.name.clone(),
                from,
                to,
            });
        }
        let data = self.inner.data.read();
        let size = self.inner.sample_size;
        let end = to.saturating_mul(size).min(data.len());
        let start = from.saturating_mul(size).min(end);
        Ok(data[start..end].to_vec())
    }

    /// All values emitted so far
    pub fn values(&self) -> Vec<f64> {
        self.inner.data.read().clone()
    }

    /// Receiver tracking the channel length, for readers that want to await growth
    pub fn watch_len(&self) -> watch::Receiver<usize> {
        self.inner.len_tx.subscribe()
    }

    /// Reject further emissions. Idempotent.
    pub fn seal(&self) {
        let _guard = self.inner.emit_lock.lock();
        self.inner.sealed.store(true, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tracing_test::traced_test;

    #[test]
    fn test_emit_assigns_contiguous_indices() {
        let channel = Channel::scalar("x");
        assert_eq!(channel.emit(&[1.0]).unwrap(), 1);
        assert_eq!(channel.emit(&[2.0, 3.0]).unwrap(), 3);
        assert_eq!(channel.get(0, 3).unwrap(), vec![1.0, 2.0, 3.0]);
        assert_eq!(channel.get(1, 2).unwrap(), vec![2.0]);
    }

    #[test]
    fn test_get_clamps_and_never_blocks() {
        let channel = Channel::scalar("x");
        channel.emit(&[1.0, 2.0]).unwrap();
        assert_eq!(channel.get(1, 100).unwrap(), vec![2.0]);
        assert!(channel.get(5, 10).unwrap().is_empty());
        assert!(channel.get(2, 1).is_err());
    }

    #[test]
    fn test_get_with_huge_bounds_on_vector_channel() {
        let channel = Channel::new("spectrum", DType::Float64, &[4]);
        channel.emit(&[1.0, 2.0, 3.0, 4.0, 5.0, 6.0, 7.0, 8.0]).unwrap();
        assert_eq!(channel.get(1, usize::MAX).unwrap(), vec![5.0, 6.0, 7.0, 8.0]);
        assert_eq!(channel.get(0, usize::MAX).unwrap().len(), 8);
        assert!(channel.get(usize::MAX / 2, usize::MAX).unwrap().is_empty());
    }

    #[test]
    fn test_subscriber_may_read_the_channel() {
        let channel = Channel::scalar("x");
        let reader = channel.clone();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        channel.subscribe(move |update| {
            sink.lock().push(reader.get(0, update.new_length)?);
            Ok(())
        });
        channel.emit(&[1.0]).unwrap();
        channel.emit(&[2.0]).unwrap();
        assert_eq!(*seen.lock(), vec![vec![1.0], vec![1.0, 2.0]]);
    }

    #[test]
    fn test_vector_samples() {
        let channel = Channel::new("spectrum", DType::UInt32, &[3]);
        assert_eq!(channel.sample_size(), 3);
        assert_eq!(channel.emit(&[1.0, 2.0, 3.0, 4.0, 5.0, 6.0]).unwrap(), 2);
        assert_eq!(channel.get(1, 2).unwrap(), vec![4.0, 5.0, 6.0]);

        let err = channel.emit(&[1.0, 2.0]).unwrap_err();
        assert!(matches!(err, ChannelError::RaggedBatch { .. }));
        assert_eq!(channel.len(), 2);
    }

    #[test]
    fn test_subscribers_see_increasing_lengths() {
        let channel = Channel::scalar("x");
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        channel.subscribe(move |update| {
            sink.lock().push((update.new_length, update.data.map(<[f64]>::len)));
            Ok(())
        });

        for i in 0..5 {
            let v = i as f64;
            channel.emit(&[v, v]).unwrap();
        }
        let lengths: Vec<usize> = seen.lock().iter().map(|(len, _)| *len).collect();
        assert_eq!(lengths, vec![2, 4, 6, 8, 10]);
        assert!(seen.lock().iter().all(|(_, n)| *n == Some(2)));
        assert_eq!(channel.get(0, 10).unwrap().len(), 10);
    }

    #[test]
    #[traced_test]
    fn test_failing_subscriber_is_isolated() {
        let channel = Channel::scalar("x");
        channel.subscribe(|_| anyhow::bail!("disk full"));
        channel.subscribe(|_| panic!("plot crashed"));
        let count = Arc::new(AtomicU64::new(0));
        let counter = count.clone();
        channel.subscribe(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });

        for _ in 0..3 {
            channel.emit(&[1.0]).unwrap();
        }
        assert_eq!(count.load(Ordering::SeqCst), 3);
        assert_eq!(channel.len(), 3);
        assert!(logs_contain("subscriber failed"));
        assert!(logs_contain("subscriber panicked"));
    }

    #[test]
    fn test_unsubscribe() {
        let channel = Channel::scalar("x");
        let count = Arc::new(AtomicU64::new(0));
        let counter = count.clone();
        let id = channel.subscribe(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });
        channel.emit(&[1.0]).unwrap();
        assert!(channel.unsubscribe(id));
        assert!(!channel.unsubscribe(id));
        channel.emit(&[2.0]).unwrap();
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_sealed_channel_rejects_emit() {
        let channel = Channel::scalar("x");
        channel.emit(&[1.0]).unwrap();
        channel.seal();
        channel.seal();
        assert!(matches!(channel.emit(&[2.0]), Err(ChannelError::Sealed(_))));
        assert_eq!(channel.values(), vec![1.0]);
    }

    #[tokio::test]
    async fn test_watch_len() {
        let channel = Channel::scalar("x");
        let mut rx = channel.watch_len();
        let producer = channel.clone();
        tokio::spawn(async move {
            producer.emit(&[1.0, 2.0, 3.0]).unwrap();
        });
        let len = *rx.wait_for(|len| *len >= 3).await.unwrap();
        assert_eq!(len, 3);
    }

    #[test]
    fn test_watch_len_wakes_on_emit() {
        let channel = Channel::scalar("x");
        let mut rx = channel.watch_len();
        {
            let mut changed = tokio_test::task::spawn(rx.changed());
            tokio_test::assert_pending!(changed.poll());
            channel.emit(&[1.0, 2.0]).unwrap();
            assert!(changed.is_woken());
            tokio_test::assert_ready_ok!(changed.poll());
        }
        assert_eq!(*rx.borrow(), 2);
    }
}
