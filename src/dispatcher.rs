use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::broadcast;

type SharedResult<T> = Result<T, Arc<anyhow::Error>>;

/// Outcome of a [`WorkDispatcher::schedule`] call.
///
/// `executed` distinguishes the caller that ran the factory from callers that
/// received a published result.
#[derive(Debug)]
pub struct Scheduled<T> {
    pub value: T,
    pub executed: bool,
}

#[derive(Debug, Error)]
pub enum DispatcherError {
    /// The factory failed. Every caller of the flight sees the same error;
    /// `executed` is true only for the caller whose factory ran.
    #[error("coalesced work failed: {source}")]
    Failed {
        source: Arc<anyhow::Error>,
        executed: bool,
    },
    /// The owning caller went away before publishing a result.
    #[error("coalesced work abandoned before completion")]
    OwnerAbandoned,
}

impl DispatcherError {
    /// Recovers the original error when this caller ran the factory itself.
    pub fn into_owned_error(self) -> anyhow::Error {
        match self {
            DispatcherError::Failed { source, .. } => {
                Arc::try_unwrap(source).unwrap_or_else(|shared| anyhow::anyhow!("{shared:#}"))
            }
            other => anyhow::anyhow!(other),
        }
    }
}

/// Per-key singleflight: at most one factory runs per key at a time, and
/// every concurrent caller for that key receives the same result.
///
/// Only map insertion and removal are synchronized; the factory itself runs
/// outside the critical section. The owner removes the in-flight entry
/// before publishing, so callers arriving after completion always start a
/// fresh flight. A waiter that drops its future simply stops listening; an
/// owner that drops its future mid-factory drops the channel, and waiters
/// observe [`DispatcherError::OwnerAbandoned`].
pub struct WorkDispatcher<T> {
    inflight: Mutex<HashMap<String, broadcast::Sender<SharedResult<T>>>>,
}

impl<T> Default for WorkDispatcher<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> WorkDispatcher<T> {
    pub fn new() -> Self {
        Self {
            inflight: Mutex::new(HashMap::new()),
        }
    }
}

impl<T> WorkDispatcher<T>
where
    T: Clone + Send + 'static,
{
    pub async fn schedule<F>(&self, key: &str, factory: F) -> Result<Scheduled<T>, DispatcherError>
    where
        F: Future<Output = anyhow::Result<T>>,
    {
        let receiver = {
            let mut inflight = self.inflight.lock();
            match inflight.get(key) {
                Some(sender) => Some(sender.subscribe()),
                None => {
                    let (sender, _) = broadcast::channel(1);
                    inflight.insert(key.to_string(), sender);
                    None
                }
            }
        };

        if let Some(mut receiver) = receiver {
            return match receiver.recv().await {
                Ok(Ok(value)) => Ok(Scheduled {
                    value,
                    executed: false,
                }),
                Ok(Err(shared)) => Err(DispatcherError::Failed {
                    source: shared,
                    executed: false,
                }),
                Err(_) => Err(DispatcherError::OwnerAbandoned),
            };
        }

        let guard = OwnerGuard {
            inflight: &self.inflight,
            key,
            armed: true,
        };
        let result = factory.await;
        let sender = guard.remove();

        match result {
            Ok(value) => {
                if let Some(sender) = sender {
                    let _ = sender.send(Ok(value.clone()));
                }
                Ok(Scheduled {
                    value,
                    executed: true,
                })
            }
            Err(err) => {
                let shared = Arc::new(err);
                if let Some(sender) = sender {
                    let _ = sender.send(Err(shared.clone()));
                }
                Err(DispatcherError::Failed {
                    source: shared,
                    executed: true,
                })
            }
        }
    }
}

// Removes the in-flight entry when the owner completes or is dropped
// mid-factory. Dropping without `remove` closes the channel, which is what
// waiters interpret as abandonment.
struct OwnerGuard<'a, T> {
    inflight: &'a Mutex<HashMap<String, broadcast::Sender<SharedResult<T>>>>,
    key: &'a str,
    armed: bool,
}

impl<T> OwnerGuard<'_, T> {
    fn remove(mut self) -> Option<broadcast::Sender<SharedResult<T>>> {
        self.armed = false;
        self.inflight.lock().remove(self.key)
    }
}

impl<T> Drop for OwnerGuard<'_, T> {
    fn drop(&mut self) {
        if self.armed {
            self.inflight.lock().remove(self.key);
        }
    }
}
