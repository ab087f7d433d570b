use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use clap::{Args, Parser, Subcommand};
use overlay_cni_ipam::credentials::{Discovery, discover};
use overlay_cni_ipam::keys::DEFAULT_KEY_PREFIX;
use overlay_cni_ipam::{EtcdStore, NodeIpam, SubnetConfig};
use tracing_appender::rolling::{InitError, RollingFileAppender, Rotation};

use crate::{Result, lock};
use crate::kubernetes::local_node_name;

#[derive(Debug, Parser)]
#[command(version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Clone, Subcommand, Debug)]
pub enum Commands {
    /// Keep the pinned pod map in sync with every peer's pod records
    Reconcile(ReconcileArgs),
    /// Return this node's block to the pool and drop its records
    Teardown(TeardownArgs),
}

/// Where the cluster state lives and how the cluster subnet is carved up.
#[derive(Args, Debug, Clone)]
pub struct KvArgs {
    /// Name of the node the agent is running on, defaults to the hostname
    #[arg(long, env = "NODE_NAME")]
    pub node_name: Option<String>,

    /// Etcd endpoint, discovered from the node kubeconfig when unset
    #[arg(long, env = "ETCD_ENDPOINT")]
    pub etcd_endpoint: Option<String>,

    /// Root of every key written by the plugin
    #[arg(long, env = "OVERLAY_CNI_KV_PREFIX", default_value = DEFAULT_KEY_PREFIX)]
    pub kv_prefix: String,

    /// Cluster pod subnet
    #[arg(long, env = "OVERLAY_CNI_SUBNET", default_value = "10.244.0.0/16")]
    pub subnet: String,

    /// Prefix length of the block each node claims
    #[arg(long, env = "OVERLAY_CNI_BLOCK_PREFIX", default_value_t = 24)]
    pub block_prefix: u8,
}

impl KvArgs {
    pub fn node_name(&self) -> Result<String> {
        match &self.node_name {
            Some(name) if !name.is_empty() => Ok(name.clone()),
            _ => local_node_name(),
        }
    }

    pub async fn connect(&self) -> Result<NodeIpam<EtcdStore>> {
        let node = self.node_name()?;
        let config = SubnetConfig::parse(&self.subnet, Some(self.block_prefix))?;
        let mut discovery = Discovery::default();
        if let Some(endpoint) = self.etcd_endpoint.as_ref().filter(|e| !e.is_empty()) {
            discovery.endpoint = Some(endpoint.clone());
        }
        let etcd = discover(&discovery)?;
        let store = EtcdStore::connect(&etcd).await?;
        Ok(NodeIpam::new(store, &self.kv_prefix, config, node)?)
    }
}

#[derive(Parser, Debug, Clone)]
pub struct ReconcileArgs {
    #[command(flatten)]
    pub kv: KvArgs,

    /// Health listener, only bound by the instance holding the lock
    #[arg(long, env = "OVERLAY_CNI_HEALTH_ADDRESS", default_value = "127.0.0.1:3190")]
    pub health_address: SocketAddr,

    /// File holding the pid of the running reconciler
    #[arg(long, default_value = lock::DEFAULT_PID_FILE)]
    pub pid_file: PathBuf,

    /// File locked by the running reconciler
    #[arg(long, default_value = lock::DEFAULT_LOCK_FILE)]
    pub lock_file: PathBuf,

    /// Path to the bpf fs for bpf maps
    #[arg(long, default_value = "/sys/fs/bpf")]
    pub bpf_fs: PathBuf,

    /// Directory for the agent log
    #[arg(long, env = "OVERLAY_CNI_LOG_DIR", default_value = "/var/log/overlay-cni")]
    pub log_dir: PathBuf,
}

#[derive(Parser, Debug, Clone)]
pub struct TeardownArgs {
    #[command(flatten)]
    pub kv: KvArgs,

    /// Directory for the agent log
    #[arg(long, env = "OVERLAY_CNI_LOG_DIR", default_value = "/var/log/overlay-cni")]
    pub log_dir: PathBuf,
}

/// Daily `agent.log` file under `dir`, which is created when missing.
pub fn log_file(dir: &Path) -> Result<RollingFileAppender, InitError> {
    RollingFileAppender::builder()
        .rotation(Rotation::DAILY)
        .filename_prefix("agent.log")
        .build(dir)
}
