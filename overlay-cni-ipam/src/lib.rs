pub mod allocator;
pub mod codec;
pub mod credentials;
pub mod keys;
pub mod kv;
pub mod node;
pub mod registry;
pub mod subnet;

use thiserror::Error;

pub use allocator::Allocator;
pub use keys::KeyLayout;
pub use kv::{KvStore, etcd::EtcdStore, memory::MemoryStore};
pub use node::NodeIpam;
pub use registry::Registry;
pub use subnet::{Partitioner, SubnetConfig};

/// Number of compare-and-swap rounds before an operation gives up with
/// [`Error::Contention`].
pub const MAX_CAS_ATTEMPTS: usize = 16;

#[derive(Error, Debug)]
pub enum Error {
    #[error("etcd error: {0}")]
    Etcd(#[from] etcd_client::Error),

    #[error("kv error: {0}")]
    Kv(String),

    #[error("watch on revision {requested} was compacted, oldest available is {compacted}")]
    Compacted { requested: i64, compacted: i64 },

    #[error("no unclaimed block left in pool {0}")]
    ExhaustedPool(String),

    #[error("no free address left in block {0}")]
    ExhaustedRange(String),

    #[error("gave up after {0} conflicting updates")]
    Contention(usize),

    #[error("invalid ipam config: {0}")]
    Config(String),

    #[error("corrupt value at {key}: {reason}")]
    Corrupt { key: String, reason: String },

    #[error("invariant violated: {0}")]
    Fatal(String),

    #[error("io error: {0}")]
    IoError(#[from] std::io::Error),

    #[error(transparent)]
    JsonConversion(#[from] serde_json::Error),

    #[error("failed to parse kubeconfig: {0}")]
    YamlConversion(#[from] serde_yaml::Error),

    #[error("addr parse error: {0}")]
    AddrParseError(#[from] std::net::AddrParseError),

    #[error("network error: {0}")]
    IpNetwork(#[from] ipnetwork::IpNetworkError),

    #[error("failed to decode credential: {0}")]
    Base64(#[from] base64::DecodeError),
}

impl Error {
    /// Errors the caller may retry without changing its input.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Error::Etcd(_) | Error::Kv(_) | Error::Compacted { .. } | Error::Contention(_)
        )
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
