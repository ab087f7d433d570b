use std::io::Write;
use std::process::ExitCode;

use semver::Version;
use serde::{Deserialize, Serialize};
use tracing::error;

use crate::types::{Dns, Interface, Ip, Route};

#[derive(Debug, Serialize, Deserialize)]
pub enum Response {
    Success(Success),
    Error(CniErrorResponse),
    Version(VersionResponse),
    /// DEL and CHECK succeed without printing anything.
    Empty,
}

impl Response {
    pub fn write_out(self) -> ExitCode {
        let (out, code) = match &self {
            Response::Success(success) => encode(success, ExitCode::SUCCESS),
            Response::Error(cni_error_response) => encode(cni_error_response, ExitCode::FAILURE),
            Response::Version(version_response) => encode(version_response, ExitCode::SUCCESS),
            Response::Empty => (vec![], ExitCode::SUCCESS),
        };
        let mut stdout = std::io::stdout();
        if let Err(e) = stdout.write_all(&out).and_then(|_| stdout.flush()) {
            error!(%e, "failed to write out response to stdout");
            return ExitCode::FAILURE;
        }
        code
    }
}

fn encode<T: Serialize>(value: &T, code: ExitCode) -> (Vec<u8>, ExitCode) {
    match serde_json::to_vec(value) {
        Ok(out) => (out, code),
        Err(e) => (e.to_string().into_bytes(), ExitCode::FAILURE),
    }
}

#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct Success {
    #[serde(
        serialize_with = "crate::serialize_to_string",
        deserialize_with = "crate::deserialize_from_str"
    )]
    pub cni_version: Version,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub interfaces: Vec<Interface>,

    #[serde(default)]
    pub ips: Vec<Ip>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub routes: Vec<Route>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dns: Option<Dns>,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct VersionResponse {
    #[serde(
        serialize_with = "crate::serialize_to_string",
        deserialize_with = "crate::deserialize_from_str"
    )]
    pub cni_version: Version,
    #[serde(
        serialize_with = "crate::serialize_to_string_slice",
        deserialize_with = "crate::deserialize_from_str_vec"
    )]
    pub supported_versions: Vec<Version>,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct CniErrorResponse {
    #[serde(
        serialize_with = "crate::serialize_to_string",
        deserialize_with = "crate::deserialize_from_str"
    )]
    pub cni_version: Version,
    pub code: u32,
    pub msg: String,
    pub details: String,
}
