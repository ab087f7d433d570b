use std::collections::BTreeMap;
use std::sync::Arc;

use futures::StreamExt;
use tokio::sync::{Mutex, broadcast};
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;

use crate::kv::{EventKind, Guard, KvStore, TxnOp, Versioned, WatchEvent, WatchStream};
use crate::{Error, Result};

const VERSION: &str = "memory";

#[derive(Clone, Debug)]
enum Signal {
    Event(WatchEvent),
    Interrupt,
}

/// In process store with the same revision and transaction semantics as etcd.
/// Keeps its full history so watches can start from any past revision.
#[derive(Clone)]
pub struct MemoryStore {
    inner: Arc<Inner>,
}

struct Inner {
    state: Mutex<State>,
    signals: broadcast::Sender<Signal>,
}

#[derive(Default)]
struct State {
    revision: i64,
    data: BTreeMap<String, Versioned>,
    history: Vec<WatchEvent>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        let (signals, _) = broadcast::channel(1024);
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(State::default()),
                signals,
            }),
        }
    }
}

impl MemoryStore {
    /// Breaks every open watch stream, used to exercise reconnects.
    pub fn interrupt_watches(&self) {
        let _ = self.inner.signals.send(Signal::Interrupt);
    }

    /// Current contents, for assertions.
    pub async fn dump(&self) -> BTreeMap<String, String> {
        let state = self.inner.state.lock().await;
        state
            .data
            .iter()
            .map(|(k, v)| (k.clone(), v.value.clone()))
            .collect()
    }

    /// Revision of the last write.
    pub async fn revision(&self) -> i64 {
        self.inner.state.lock().await.revision
    }

    fn apply(&self, state: &mut State, ops: Vec<TxnOp>) {
        let revision = state.revision + 1;
        let mut changed = false;
        for op in ops {
            let event = match op {
                TxnOp::Put { key, value } => {
                    state.data.insert(
                        key.clone(),
                        Versioned {
                            value: value.clone(),
                            mod_revision: revision,
                        },
                    );
                    WatchEvent {
                        kind: EventKind::Put,
                        key,
                        value,
                        revision,
                    }
                }
                TxnOp::Delete { key } => {
                    if state.data.remove(&key).is_none() {
                        continue;
                    }
                    WatchEvent {
                        kind: EventKind::Delete,
                        key,
                        value: String::new(),
                        revision,
                    }
                }
            };
            changed = true;
            state.history.push(event.clone());
            let _ = self.inner.signals.send(Signal::Event(event));
        }
        if changed {
            state.revision = revision;
        }
    }
}

#[tonic::async_trait]
impl KvStore for MemoryStore {
    async fn snapshot(&self, key: &str) -> Result<(Option<Versioned>, i64)> {
        let state = self.inner.state.lock().await;
        Ok((state.data.get(key).cloned(), state.revision))
    }

    async fn get_all_keys(&self, prefix: &str) -> Result<Vec<String>> {
        let state = self.inner.state.lock().await;
        Ok(state
            .data
            .range(prefix.to_owned()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, _)| k.clone())
            .collect())
    }

    async fn put(&self, key: &str, value: &str) -> Result<()> {
        let mut state = self.inner.state.lock().await;
        self.apply(&mut state, vec![TxnOp::put(key, value)]);
        Ok(())
    }

    async fn delete(&self, key: &str, prefix: bool) -> Result<()> {
        let mut state = self.inner.state.lock().await;
        let ops = if prefix {
            state
                .data
                .range(key.to_owned()..)
                .take_while(|(k, _)| k.starts_with(key))
                .map(|(k, _)| TxnOp::delete(k.clone()))
                .collect()
        } else {
            vec![TxnOp::delete(key)]
        };
        self.apply(&mut state, ops);
        Ok(())
    }

    async fn transaction(&self, guards: Vec<Guard>, ops: Vec<TxnOp>) -> Result<bool> {
        let mut state = self.inner.state.lock().await;
        let holds = guards.iter().all(|g| {
            state.data.get(&g.key).map_or(0, |v| v.mod_revision) == g.mod_revision
        });
        if holds {
            self.apply(&mut state, ops);
        }
        Ok(holds)
    }

    async fn watch_stream(&self, key: &str, start_revision: i64) -> Result<WatchStream> {
        let state = self.inner.state.lock().await;
        // subscribing under the lock means no write can fall between the
        // replayed history and the live feed
        let live = BroadcastStream::new(self.inner.signals.subscribe());
        let from = if start_revision <= 0 {
            state.revision + 1
        } else {
            start_revision
        };
        let replay: Vec<Result<Vec<WatchEvent>>> = state
            .history
            .iter()
            .filter(|e| e.key == key && e.revision >= from)
            .map(|e| Ok(vec![e.clone()]))
            .collect();
        let last_replayed = state.revision;
        drop(state);

        let key = key.to_owned();
        let live = live.filter_map(move |signal| {
            let out = match signal {
                Ok(Signal::Event(event)) if event.key == key && event.revision > last_replayed => {
                    Some(Ok(vec![event]))
                }
                Ok(Signal::Event(_)) => None,
                Ok(Signal::Interrupt) => Some(Err(Error::Kv("watch interrupted".into()))),
                Err(BroadcastStreamRecvError::Lagged(n)) => {
                    Some(Err(Error::Kv(format!("watch lagged by {n} events"))))
                }
            };
            futures::future::ready(out)
        });
        Ok(futures::stream::iter(replay).chain(live).boxed())
    }

    async fn status(&self) -> Result<String> {
        Ok(VERSION.to_owned())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[tokio::test]
    async fn test_transaction_guards() -> Result<()> {
        let store = MemoryStore::default();
        assert!(
            store
                .transaction(vec![Guard::absent("/a")], vec![TxnOp::put("/a", "1")])
                .await?
        );
        assert!(
            !store
                .transaction(vec![Guard::absent("/a")], vec![TxnOp::put("/a", "2")])
                .await?
        );
        let current = store.get("/a").await?;
        assert_eq!(current.as_ref().map(|v| v.value.as_str()), Some("1"));
        assert!(
            store
                .transaction(
                    vec![Guard::unchanged("/a", &current)],
                    vec![TxnOp::put("/a", "2"), TxnOp::put("/b", "x")]
                )
                .await?
        );
        let a = store.get("/a").await?.unwrap();
        let b = store.get("/b").await?.unwrap();
        assert_eq!(a.mod_revision, b.mod_revision);
        Ok(())
    }

    #[tokio::test]
    async fn test_prefix_scan_and_delete() -> Result<()> {
        let store = MemoryStore::default();
        store.put("/n/a/1", "x").await?;
        store.put("/n/a/2", "x").await?;
        store.put("/n/b", "x").await?;
        assert_eq!(store.get_all_keys("/n/a/").await?, vec!["/n/a/1", "/n/a/2"]);
        store.delete("/n/a/", true).await?;
        assert_eq!(store.get_all_keys("/n/").await?, vec!["/n/b"]);
        Ok(())
    }

    #[tokio::test]
    async fn test_delete_of_missing_key_is_not_a_write() -> Result<()> {
        let store = MemoryStore::default();
        store.delete("/missing", false).await?;
        assert_eq!(store.revision().await, 0);
        Ok(())
    }
}
