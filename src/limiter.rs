//! Per-provider concurrency limiter
//!
//! Each provider owns an independent pool of permits. Callers beyond the pool
//! size wait in FIFO order; nobody is rejected.

use crate::model::Provider;
use crate::{ChangeflowError, Result};
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tracing::trace;

/// Default permit count per provider
pub const DEFAULT_PERMITS: usize = 5;

/// Bounded-concurrency gate keyed by provider
#[derive(Debug)]
pub struct ProviderLimiter {
    pools: HashMap<Provider, Arc<Semaphore>>,
    permits: HashMap<Provider, usize>,
}

impl ProviderLimiter {
    /// Create a limiter with the given permit counts.
    ///
    /// Providers missing from `limits` get [`DEFAULT_PERMITS`]; counts below
    /// one are raised to one.
    pub fn new(limits: &HashMap<Provider, usize>) -> Self {
        let permits: HashMap<Provider, usize> = Provider::ALL
            .iter()
            .map(|p| (*p, limits.get(p).copied().unwrap_or(DEFAULT_PERMITS).max(1)))
            .collect();

        let pools = permits
            .iter()
            // tokio's semaphore queues waiters fairly (FIFO)
            .map(|(p, n)| (*p, Arc::new(Semaphore::new(*n))))
            .collect();

        Self { pools, permits }
    }

    /// Create a limiter with the same permit count for every provider
    pub fn uniform(permits: usize) -> Self {
        let limits = Provider::ALL.iter().map(|p| (*p, permits)).collect();
        Self::new(&limits)
    }

    /// Configured permit count for a provider
    pub fn permits(&self, provider: Provider) -> usize {
        self.permits.get(&provider).copied().unwrap_or(DEFAULT_PERMITS)
    }

    /// Permits currently free for a provider
    pub fn available(&self, provider: Provider) -> usize {
        self.pools
            .get(&provider)
            .map(|pool| pool.available_permits())
            .unwrap_or(0)
    }

    /// Run `task` while holding one of the provider's permits.
    ///
    /// The permit is held until `task` completes, so a task that retries
    /// internally occupies exactly one permit for its whole retry sequence.
    pub async fn run_under_limit<F, T>(&self, provider: Provider, task: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        let pool = self.pools.get(&provider).ok_or_else(|| {
            ChangeflowError::Config(format!("No concurrency pool for {}", provider))
        })?;

        let _permit = pool
            .acquire()
            .await
            .map_err(|_| ChangeflowError::Other(format!("{} limiter closed", provider)))?;

        trace!(
            provider = %provider,
            available = pool.available_permits(),
            "Acquired provider permit"
        );

        task.await
    }
}

impl Default for ProviderLimiter {
    fn default() -> Self {
        Self::uniform(DEFAULT_PERMITS)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[test]
    fn test_permit_counts() {
        let mut limits = HashMap::new();
        limits.insert(Provider::GitHub, 2);
        limits.insert(Provider::Jira, 0);

        let limiter = ProviderLimiter::new(&limits);
        assert_eq!(limiter.permits(Provider::GitHub), 2);
        assert_eq!(limiter.permits(Provider::Jira), 1);
        assert_eq!(limiter.permits(Provider::Linear), DEFAULT_PERMITS);
    }

    #[tokio::test]
    async fn test_never_exceeds_permit_count() {
        let limiter = Arc::new(ProviderLimiter::uniform(5));
        let in_flight = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let handles: Vec<_> = (0..50)
            .map(|_| {
                let limiter = Arc::clone(&limiter);
                let in_flight = Arc::clone(&in_flight);
                let peak = Arc::clone(&peak);
                tokio::spawn(async move {
                    limiter
                        .run_under_limit(Provider::GitHub, async {
                            let now = in_flight.fetch_add(1, Ordering::SeqCst) + 1;
                            peak.fetch_max(now, Ordering::SeqCst);
                            tokio::time::sleep(Duration::from_millis(10)).await;
                            in_flight.fetch_sub(1, Ordering::SeqCst);
                            Ok(())
                        })
                        .await
                })
            })
            .collect();

        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        assert_eq!(peak.load(Ordering::SeqCst), 5);
        assert_eq!(limiter.available(Provider::GitHub), 5);
    }

    #[tokio::test]
    async fn test_providers_have_independent_pools() {
        let limiter = Arc::new(ProviderLimiter::uniform(1));
        let (release_tx, release_rx) = tokio::sync::oneshot::channel::<()>();

        let held = {
            let limiter = Arc::clone(&limiter);
            tokio::spawn(async move {
                limiter
                    .run_under_limit(Provider::GitHub, async {
                        let _ = release_rx.await;
                        Ok(())
                    })
                    .await
            })
        };

        // Wait for the GitHub permit to be taken
        while limiter.available(Provider::GitHub) != 0 {
            tokio::task::yield_now().await;
        }

        // Jira is unaffected by the saturated GitHub pool
        let value = tokio::time::timeout(
            Duration::from_secs(1),
            limiter.run_under_limit(Provider::Jira, async { Ok(7) }),
        )
        .await
        .expect("jira call should not wait on github")
        .unwrap();
        assert_eq!(value, 7);

        release_tx.send(()).unwrap();
        held.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_permit_released_on_error() {
        let limiter = ProviderLimiter::uniform(1);

        let result: Result<()> = limiter
            .run_under_limit(Provider::Linear, async {
                Err(ChangeflowError::Network("reset".into()))
            })
            .await;
        assert!(result.is_err());
        assert_eq!(limiter.available(Provider::Linear), 1);
    }
}
