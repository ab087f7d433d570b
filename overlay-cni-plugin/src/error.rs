use semver::Version;
use thiserror::Error;

use crate::response::{CniErrorResponse, Response};

#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error("incompatible version {0}")]
    IncompatibleVersion(Version),

    #[error("container unknown: {0}")]
    ContainerUnknown(String),

    #[error("invalid environment variables: {0}")]
    InvalidRequiredEnvVariables(String),

    #[error("invalid network config: {0}")]
    InvalidNetworkConfig(String),

    #[error("transient error: {0}")]
    Transient(String),

    #[error("parse error: {0}")]
    Parse(String),

    #[error(transparent)]
    Ipam(#[from] overlay_cni_ipam::Error),

    #[error(transparent)]
    Ebpf(#[from] overlay_cni_agent::Error),

    #[error("{0}")]
    Link(String),

    #[error("netlink error: {0}")]
    Netlink(#[from] rtnetlink::Error),

    #[error("network namespace error: {0}")]
    NetNs(#[from] netns_rs::Error),

    #[error("{0}")]
    Fatal(String),
}

impl Error {
    /// CNI error code and message for the envelope.
    pub fn code(&self) -> (u32, &'static str) {
        match self {
            Error::IncompatibleVersion(_) => (1, "Incompatible CNI Version"),
            Error::ContainerUnknown(_) => (3, "Unknown Container"),
            Error::InvalidRequiredEnvVariables(_) | Error::Parse(_) => {
                (4, "Invalid Required Environment Variables")
            }
            Error::Io(_) => (5, "I/O Error"),
            Error::Json(_) => (6, "JSON Error"),
            Error::InvalidNetworkConfig(_) => (7, "Invalid Network Config"),
            Error::Transient(_) => (11, "Transient Error"),
            Error::Ipam(e) => ipam_code(e),
            Error::Ebpf(e) => match e {
                overlay_cni_agent::Error::Ipam(e) => ipam_code(e),
                overlay_cni_agent::Error::IoError(_) | overlay_cni_agent::Error::Nix(_) => {
                    (5, "I/O Error")
                }
                overlay_cni_agent::Error::KubeError(_) => (11, "Transient Error"),
                overlay_cni_agent::Error::KubeConfig(_) => (7, "Invalid Network Config"),
                _ => (103, "EBPF Error"),
            },
            Error::Link(_) | Error::Netlink(_) | Error::NetNs(_) => (102, "Link Error"),
            Error::Fatal(_) => (110, "Fatal Error"),
        }
    }

    pub fn into_response(self, cni_version: Version) -> Response {
        let (code, msg) = self.code();
        Response::Error(CniErrorResponse {
            cni_version,
            code,
            msg: msg.into(),
            details: self.to_string(),
        })
    }
}

fn ipam_code(e: &overlay_cni_ipam::Error) -> (u32, &'static str) {
    use overlay_cni_ipam::Error as Ipam;
    match e {
        Ipam::ExhaustedPool(_) => (100, "Exhausted Pool"),
        Ipam::ExhaustedRange(_) => (101, "Exhausted Range"),
        Ipam::Config(_) | Ipam::AddrParseError(_) | Ipam::IpNetwork(_) => {
            (7, "Invalid Network Config")
        }
        Ipam::IoError(_) => (5, "I/O Error"),
        Ipam::JsonConversion(_) | Ipam::YamlConversion(_) | Ipam::Base64(_) => (6, "JSON Error"),
        Ipam::Corrupt { .. } | Ipam::Fatal(_) => (110, "Fatal Error"),
        Ipam::Etcd(_) | Ipam::Kv(_) | Ipam::Compacted { .. } | Ipam::Contention(_) => {
            (11, "Transient Error")
        }
    }
}
