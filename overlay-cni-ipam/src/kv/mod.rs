pub mod etcd;
pub mod memory;

use std::future::Future;
use std::time::Duration;

use futures::StreamExt;
use futures::stream::BoxStream;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{Error, Result};

const WATCH_BACKOFF_STEP: Duration = Duration::from_millis(250);
const WATCH_BACKOFF_MAX: Duration = Duration::from_secs(5);

/// A value together with the revision that last modified it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Versioned {
    pub value: String,
    pub mod_revision: i64,
}

/// Transaction predicate: `key` must still be at `mod_revision`. A revision of
/// zero asserts that the key does not exist.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Guard {
    pub key: String,
    pub mod_revision: i64,
}

impl Guard {
    pub fn absent(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            mod_revision: 0,
        }
    }

    /// Guards against any change since `observed` was read.
    pub fn unchanged(key: impl Into<String>, observed: &Option<Versioned>) -> Self {
        Self {
            key: key.into(),
            mod_revision: observed.as_ref().map_or(0, |v| v.mod_revision),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TxnOp {
    Put { key: String, value: String },
    Delete { key: String },
}

impl TxnOp {
    pub fn put(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self::Put {
            key: key.into(),
            value: value.into(),
        }
    }

    pub fn delete(key: impl Into<String>) -> Self {
        Self::Delete { key: key.into() }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EventKind {
    Put,
    Delete,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WatchEvent {
    pub kind: EventKind,
    pub key: String,
    pub value: String,
    pub revision: i64,
}

pub type WatchStream = BoxStream<'static, Result<Vec<WatchEvent>>>;

/// Linearizable access to the cluster key value store.
#[tonic::async_trait]
pub trait KvStore: Clone + Send + Sync + 'static {
    /// Reads `key` together with the store revision the read was served at.
    async fn snapshot(&self, key: &str) -> Result<(Option<Versioned>, i64)>;

    async fn get(&self, key: &str) -> Result<Option<Versioned>> {
        Ok(self.snapshot(key).await?.0)
    }

    async fn get_all_keys(&self, prefix: &str) -> Result<Vec<String>>;

    async fn put(&self, key: &str, value: &str) -> Result<()>;

    async fn delete(&self, key: &str, prefix: bool) -> Result<()>;

    /// Applies `ops` atomically if every guard holds. Returns false when a
    /// guard failed and nothing was written.
    async fn transaction(&self, guards: Vec<Guard>, ops: Vec<TxnOp>) -> Result<bool>;

    /// Raw event stream for a single key starting at `start_revision`
    /// (inclusive). Zero starts at the current revision.
    async fn watch_stream(&self, key: &str, start_revision: i64) -> Result<WatchStream>;

    /// Version string reported by the store.
    async fn status(&self) -> Result<String>;
}

/// Handle to a running [`watch`]. Dropping it leaves the watch running.
pub struct WatchHandle {
    handle: JoinHandle<()>,
}

impl WatchHandle {
    pub async fn join(self) {
        if let Err(e) = self.handle.await {
            warn!(%e, "watch task failed to complete");
        }
    }
}

/// Watches `key`, calling `callback` once per event in commit order.
///
/// Transport errors re-open the stream from the revision after the last
/// delivered event. When the store has compacted that revision away the key is
/// re-read and its current state is delivered as a single synthetic event.
/// Runs until `cancel` fires.
pub fn watch<S, F, Fut>(
    store: &S,
    key: impl Into<String>,
    start_revision: i64,
    cancel: &CancellationToken,
    callback: F,
) -> WatchHandle
where
    S: KvStore,
    F: FnMut(WatchEvent) -> Fut + Send + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    let handle = tokio::spawn(run_watch(
        store.clone(),
        key.into(),
        start_revision,
        cancel.clone(),
        callback,
    ));
    WatchHandle { handle }
}

async fn run_watch<S, F, Fut>(
    store: S,
    key: String,
    start_revision: i64,
    cancel: CancellationToken,
    mut callback: F,
) where
    S: KvStore,
    F: FnMut(WatchEvent) -> Fut + Send + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    let mut next_revision = start_revision;
    let mut attempt: u32 = 0;
    info!(%key, revision = start_revision, "starting watch");
    loop {
        let opened = tokio::select! {
            _ = cancel.cancelled() => return,
            s = store.watch_stream(&key, next_revision) => s,
        };
        match opened {
            Ok(mut stream) => loop {
                let next = tokio::select! {
                    _ = cancel.cancelled() => return,
                    n = stream.next() => n,
                };
                match next {
                    Some(Ok(events)) => {
                        attempt = 0;
                        for event in events {
                            if event.key != key || event.revision < next_revision {
                                continue;
                            }
                            next_revision = event.revision + 1;
                            callback(event).await;
                        }
                    }
                    Some(Err(Error::Compacted { compacted, .. })) => {
                        warn!(%key, compacted, "watch revision compacted, resyncing");
                        match resync(&store, &key).await {
                            Ok((event, revision)) => {
                                next_revision = revision.max(compacted) + 1;
                                if let Some(event) = event {
                                    callback(event).await;
                                }
                            }
                            Err(e) => warn!(%key, %e, "failed to resync watched key"),
                        }
                        break;
                    }
                    Some(Err(e)) => {
                        warn!(%key, %e, "watch stream failed");
                        break;
                    }
                    None => {
                        debug!(%key, "watch stream closed");
                        break;
                    }
                }
            },
            Err(e) => warn!(%key, %e, "failed to open watch"),
        }
        attempt = attempt.saturating_add(1);
        let delay = backoff(attempt);
        debug!(%key, attempt, ?delay, "re-establishing watch");
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = tokio::time::sleep(delay) => {},
        }
    }
}

async fn resync<S: KvStore>(store: &S, key: &str) -> Result<(Option<WatchEvent>, i64)> {
    let (current, revision) = store.snapshot(key).await?;
    let event = match current {
        Some(v) => WatchEvent {
            kind: EventKind::Put,
            key: key.to_owned(),
            value: v.value,
            revision: v.mod_revision,
        },
        None => WatchEvent {
            kind: EventKind::Delete,
            key: key.to_owned(),
            value: String::new(),
            revision,
        },
    };
    Ok((Some(event), revision))
}

/// Grows with the log of the attempt count, capped at five seconds.
pub fn backoff(attempt: u32) -> Duration {
    let steps = u32::BITS - attempt.leading_zeros();
    WATCH_BACKOFF_STEP.saturating_mul(steps).min(WATCH_BACKOFF_MAX)
}

#[cfg(test)]
mod test {
    use std::sync::{Arc, Mutex};

    use super::*;
    use crate::MemoryStore;

    #[test]
    fn test_backoff_is_logarithmic() {
        assert_eq!(backoff(1), Duration::from_millis(250));
        assert_eq!(backoff(2), Duration::from_millis(500));
        assert_eq!(backoff(3), Duration::from_millis(500));
        assert_eq!(backoff(4), Duration::from_millis(750));
        assert_eq!(backoff(8), Duration::from_millis(1000));
        assert_eq!(backoff(u32::MAX), WATCH_BACKOFF_MAX);
    }

    async fn wait_for(seen: &Arc<Mutex<Vec<WatchEvent>>>, count: usize) {
        for _ in 0..200 {
            if seen.lock().unwrap().len() >= count {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("timed out waiting for {count} watch events");
    }

    #[tokio::test]
    async fn test_watch_resumes_without_replay_or_gap() -> crate::Result<()> {
        let store = MemoryStore::default();
        let (_, revision) = store.snapshot("/k").await?;
        let seen = Arc::new(Mutex::new(vec![]));
        let cancel = CancellationToken::new();

        let sink = seen.clone();
        let handle = watch(&store, "/k", revision + 1, &cancel, move |event| {
            let sink = sink.clone();
            async move {
                sink.lock().unwrap().push(event);
            }
        });

        store.put("/k", "one").await?;
        store.put("/other", "ignored").await?;
        wait_for(&seen, 1).await;

        store.interrupt_watches();
        store.put("/k", "two").await?;
        store.delete("/k", false).await?;
        wait_for(&seen, 3).await;

        cancel.cancel();
        handle.join().await;

        let seen = seen.lock().unwrap();
        let values: Vec<_> = seen.iter().map(|e| (e.kind, e.value.as_str())).collect();
        assert_eq!(
            values,
            vec![
                (EventKind::Put, "one"),
                (EventKind::Put, "two"),
                (EventKind::Delete, "")
            ]
        );
        Ok(())
    }

    #[tokio::test]
    async fn test_cancel_stops_watch() {
        let store = MemoryStore::default();
        let cancel = CancellationToken::new();
        let handle = watch(&store, "/k", 0, &cancel, |_| async {});
        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(1), handle.join())
            .await
            .expect("watch did not stop");
    }
}
