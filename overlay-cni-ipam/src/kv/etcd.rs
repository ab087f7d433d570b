use std::path::PathBuf;
use std::time::Duration;

use etcd_client::{
    Certificate, Client, Compare, CompareOp, ConnectOptions, DeleteOptions, EventType,
    GetOptions, Identity, TlsOptions, Txn, WatchOptions,
};
use futures::StreamExt;
use tracing::{debug, info};

use crate::kv::{EventKind, Guard, KvStore, TxnOp, Versioned, WatchEvent, WatchStream};
use crate::{Error, Result};

pub const DIAL_TIMEOUT: Duration = Duration::from_secs(30);
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(2);

/// Client certificate material on disk.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TlsMaterials {
    pub ca: PathBuf,
    pub cert: PathBuf,
    pub key: PathBuf,
}

#[derive(Clone, Debug)]
pub struct EtcdConfig {
    pub endpoints: Vec<String>,
    pub tls: Option<TlsMaterials>,
    pub dial_timeout: Duration,
    pub request_timeout: Duration,
}

impl EtcdConfig {
    pub fn new(endpoint: impl Into<String>, tls: Option<TlsMaterials>) -> Self {
        Self {
            endpoints: vec![endpoint.into()],
            tls,
            dial_timeout: DIAL_TIMEOUT,
            request_timeout: REQUEST_TIMEOUT,
        }
    }
}

#[derive(Clone)]
pub struct EtcdStore {
    client: Client,
}

impl EtcdStore {
    pub async fn connect(config: &EtcdConfig) -> Result<Self> {
        let mut options = ConnectOptions::new()
            .with_connect_timeout(config.dial_timeout)
            .with_timeout(config.request_timeout);
        if let Some(tls) = &config.tls {
            let ca = tokio::fs::read(&tls.ca).await?;
            let cert = tokio::fs::read(&tls.cert).await?;
            let key = tokio::fs::read(&tls.key).await?;
            options = options.with_tls(
                TlsOptions::new()
                    .ca_certificate(Certificate::from_pem(ca))
                    .identity(Identity::from_pem(cert, key)),
            );
        }
        info!(endpoints = ?config.endpoints, tls = config.tls.is_some(), "connecting to etcd");
        let client = Client::connect(&config.endpoints, Some(options)).await?;
        Ok(Self { client })
    }
}

#[tonic::async_trait]
impl KvStore for EtcdStore {
    async fn snapshot(&self, key: &str) -> Result<(Option<Versioned>, i64)> {
        let mut client = self.client.clone();
        let resp = client.get(key, None).await?;
        let revision = resp.header().map_or(0, |h| h.revision());
        let value = match resp.kvs().first() {
            Some(kv) => Some(Versioned {
                value: kv.value_str()?.to_owned(),
                mod_revision: kv.mod_revision(),
            }),
            None => None,
        };
        Ok((value, revision))
    }

    async fn get_all_keys(&self, prefix: &str) -> Result<Vec<String>> {
        let mut client = self.client.clone();
        let resp = client
            .get(prefix, Some(GetOptions::new().with_prefix().with_keys_only()))
            .await?;
        resp.kvs()
            .iter()
            .map(|kv| Ok(kv.key_str()?.to_owned()))
            .collect()
    }

    async fn put(&self, key: &str, value: &str) -> Result<()> {
        let mut client = self.client.clone();
        client.put(key, value, None).await?;
        Ok(())
    }

    async fn delete(&self, key: &str, prefix: bool) -> Result<()> {
        let mut client = self.client.clone();
        let options = prefix.then(|| DeleteOptions::new().with_prefix());
        let resp = client.delete(key, options).await?;
        debug!(key, prefix, deleted = resp.deleted(), "deleted keys");
        Ok(())
    }

    async fn transaction(&self, guards: Vec<Guard>, ops: Vec<TxnOp>) -> Result<bool> {
        let mut client = self.client.clone();
        let compares: Vec<Compare> = guards
            .into_iter()
            .map(|g| Compare::mod_revision(g.key, CompareOp::Equal, g.mod_revision))
            .collect();
        let ops: Vec<etcd_client::TxnOp> = ops
            .into_iter()
            .map(|op| match op {
                TxnOp::Put { key, value } => etcd_client::TxnOp::put(key, value, None),
                TxnOp::Delete { key } => etcd_client::TxnOp::delete(key, None),
            })
            .collect();
        let resp = client.txn(Txn::new().when(compares).and_then(ops)).await?;
        Ok(resp.succeeded())
    }

    async fn watch_stream(&self, key: &str, start_revision: i64) -> Result<WatchStream> {
        let mut client = self.client.clone();
        let mut options = WatchOptions::new();
        if start_revision > 0 {
            options = options.with_start_revision(start_revision);
        }
        let (watcher, stream) = client.watch(key, Some(options)).await?;
        // the watcher owns the request side of the stream and must live as long
        // as the responses are read
        let stream = futures::stream::unfold(
            (watcher, stream, start_revision),
            |(watcher, mut stream, requested)| async move {
                let resp = match stream.message().await {
                    Ok(Some(resp)) => resp,
                    Ok(None) => return None,
                    Err(e) => return Some((Err(Error::from(e)), (watcher, stream, requested))),
                };
                if resp.compact_revision() > 0 {
                    let err = Error::Compacted {
                        requested,
                        compacted: resp.compact_revision(),
                    };
                    return Some((Err(err), (watcher, stream, requested)));
                }
                if resp.canceled() {
                    let err = Error::Kv(format!("watch canceled: {}", resp.cancel_reason()));
                    return Some((Err(err), (watcher, stream, requested)));
                }
                let events = resp
                    .events()
                    .iter()
                    .filter_map(|event| {
                        let kv = event.kv()?;
                        let kind = match event.event_type() {
                            EventType::Put => EventKind::Put,
                            EventType::Delete => EventKind::Delete,
                        };
                        Some(WatchEvent {
                            kind,
                            key: kv.key_str().ok()?.to_owned(),
                            value: kv.value_str().unwrap_or_default().to_owned(),
                            revision: kv.mod_revision(),
                        })
                    })
                    .collect();
                Some((Ok(events), (watcher, stream, requested)))
            },
        );
        Ok(stream.boxed())
    }

    async fn status(&self) -> Result<String> {
        let mut client = self.client.clone();
        let resp = client.status().await?;
        Ok(resp.version().to_owned())
    }
}
