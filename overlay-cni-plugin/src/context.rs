use std::path::{Path, PathBuf};

use overlay_cni_agent::bpf::loader::TcObjects;
use overlay_cni_agent::kubernetes::local_node_name;
use overlay_cni_agent::lock::{DEFAULT_LOCK_FILE, DEFAULT_PID_FILE};
use overlay_cni_ipam::credentials::{Discovery, discover};
use overlay_cni_ipam::{EtcdStore, KvStore, NodeIpam, SubnetConfig};
use tracing::debug;

use crate::Result;
use crate::types::NetConf;

pub const DEFAULT_BPF_FS: &str = "/sys/fs/bpf";

/// Everything a mode needs for one invocation: the node's ipam view and
/// where the tc objects, pinned maps and reconciler lock live.
pub struct PluginContext<S> {
    ipam: NodeIpam<S>,
    tc: TcObjects,
    lock_file: PathBuf,
    pid_file: PathBuf,
}

impl<S: KvStore> PluginContext<S> {
    pub fn new(ipam: NodeIpam<S>, conf: &NetConf) -> Self {
        Self {
            ipam,
            tc: TcObjects::new(&conf.bpf_object_dir, DEFAULT_BPF_FS)
                .with_max_entries(conf.map_max_entries),
            lock_file: PathBuf::from(DEFAULT_LOCK_FILE),
            pid_file: PathBuf::from(DEFAULT_PID_FILE),
        }
    }

    pub fn ipam(&self) -> &NodeIpam<S> {
        &self.ipam
    }

    pub fn tc(&self) -> &TcObjects {
        &self.tc
    }

    pub fn bpf_fs(&self) -> &Path {
        self.tc.bpf_fs()
    }

    pub fn lock_file(&self) -> &Path {
        &self.lock_file
    }

    pub fn pid_file(&self) -> &Path {
        &self.pid_file
    }
}

/// Opens the store for this node. Runs only once the config is known to be
/// valid, so a bad config never costs a connection.
pub async fn connect(conf: NetConf) -> Result<PluginContext<EtcdStore>> {
    let node = local_node_name()?;
    let config = SubnetConfig::parse(&conf.subnet, Some(conf.block_prefix()))?;

    let mut discovery = Discovery::default();
    if discovery.endpoint.is_none() {
        discovery.endpoint = conf.etcd_endpoint.clone().filter(|e| !e.is_empty());
    }
    let etcd = discover(&discovery)?;
    debug!(node, "connecting to the ipam store");
    let store = EtcdStore::connect(&etcd).await?;

    let ipam = NodeIpam::new(store, &conf.kv_prefix, config, node)?;
    Ok(PluginContext::new(ipam, &conf))
}
