pub mod bpf;
pub mod config;
pub mod http;
pub mod kubernetes;
pub mod lock;
pub mod reconciler;

use aya::EbpfError;
use aya::pin::PinError;
use aya::programs::ProgramError;
use aya::programs::links::LinkError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("{0}")]
    EbpfError(String),

    #[error("{0}")]
    EbpfProgramError(String),

    #[error("io error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("kube error: {0}")]
    KubeError(#[from] kube::Error),

    #[error("failed to create config from kubeconfig: {0}")]
    KubeConfig(#[from] kube::config::KubeconfigError),

    #[error("ipam error: {0}")]
    Ipam(#[from] overlay_cni_ipam::Error),

    #[error("addr parse error: {0}")]
    AddrParseError(#[from] std::net::AddrParseError),

    #[error("map error: {0}")]
    MapError(#[from] aya::maps::MapError),

    #[error("map {name} not found")]
    MapNotFound { name: String },

    #[error("failed to pin: {0}")]
    PinError(#[from] PinError),

    #[error("link error: {0}")]
    LinkError(#[from] LinkError),

    #[error("node {0} has no InternalIP address")]
    NodeAddress(String),

    #[error("system call failed: {0}")]
    Nix(#[from] nix::Error),

    #[error("task failed: {0}")]
    Task(String),

    #[error("{0}")]
    Other(String),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

impl From<aya::EbpfError> for Error {
    fn from(err: EbpfError) -> Self {
        Self::EbpfError(err.to_string())
    }
}

impl From<aya::programs::ProgramError> for Error {
    fn from(err: ProgramError) -> Self {
        Self::EbpfProgramError(err.to_string())
    }
}
