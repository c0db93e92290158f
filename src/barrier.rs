//! "Wait for all, collect the first error" combinator.
//!
//! The chain driver issues the calls of one execution level concurrently and
//! advances only when every one of them has completed. Calls are initiated in
//! iteration order; completion order is whatever the devices produce. The
//! first error to complete becomes the primary error, later ones are kept as
//! suppressed errors so nothing is lost.

use futures::stream::{FuturesUnordered, StreamExt};
use std::future::Future;

use crate::error::ScanError;

/// Errors collected from one barrier.
#[derive(Debug)]
pub struct LevelFailure {
    /// First error to complete
    pub primary: ScanError,
    /// Errors that completed afterwards
    pub suppressed: Vec<ScanError>,
}

/// Drive every future to completion concurrently.
///
/// Returns the outputs in iteration order when all succeed.
pub async fn wait_all<I, F, T>(calls: I) -> Result<Vec<T>, LevelFailure>
where
    I: IntoIterator<Item = F>,
    F: Future<Output = Result<T, ScanError>>,
{
    let mut pending: FuturesUnordered<_> = calls
        .into_iter()
        .enumerate()
        .map(|(index, call)| async move { (index, call.await) })
        .collect();

    let mut outputs: Vec<Option<T>> = Vec::with_capacity(pending.len());
    outputs.resize_with(pending.len(), || None);
    let mut errors: Vec<ScanError> = Vec::new();

    while let Some((index, result)) = pending.next().await {
        match result {
            Ok(value) => outputs[index] = Some(value),
            Err(e) => errors.push(e),
        }
    }

    let mut errors = errors.into_iter();
    match errors.next() {
        Some(primary) => Err(LevelFailure {
            primary,
            suppressed: errors.collect(),
        }),
        None => Ok(outputs.into_iter().flatten().collect()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Operation;
    use std::time::Duration;
    use tokio::time::sleep;

    fn fault(name: &str) -> ScanError {
        ScanError::device(name, Operation::Prepare, anyhow::anyhow!("boom"))
    }

    #[tokio::test]
    async fn test_all_succeed_in_order() {
        let calls = (0..4u64).map(|i| async move {
            sleep(Duration::from_millis(10 * (4 - i))).await;
            Ok::<_, ScanError>(i)
        });
        assert_eq!(wait_all(calls).await.unwrap(), vec![0, 1, 2, 3]);
    }

    #[tokio::test]
    async fn test_waits_for_all_and_keeps_first_error() {
        let finished = std::sync::Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let calls = (0..3u64).map(|i| {
            let finished = finished.clone();
            async move {
                match i {
                    0 => {
                        sleep(Duration::from_millis(30)).await;
                        Err(fault("slow"))
                    }
                    1 => {
                        sleep(Duration::from_millis(5)).await;
                        Err(fault("fast"))
                    }
                    _ => {
                        sleep(Duration::from_millis(50)).await;
                        finished.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                        Ok(())
                    }
                }
            }
        });

        let failure = wait_all(calls).await.unwrap_err();
        assert_eq!(failure.primary.object(), Some("fast"));
        assert_eq!(failure.suppressed.len(), 1);
        assert_eq!(failure.suppressed[0].object(), Some("slow"));
        assert_eq!(finished.load(std::sync::atomic::Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_empty_level() {
        let calls: Vec<std::future::Ready<Result<(), ScanError>>> = Vec::new();
        assert!(wait_all(calls).await.unwrap().is_empty());
    }
}
