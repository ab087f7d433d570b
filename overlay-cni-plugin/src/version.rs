use semver::Version;
use serde::Deserialize;
use tracing::info;

use crate::config::Command;
use crate::response::{Response, VersionResponse};
use crate::{CNI_VERSION, Error, Result, SUPPORTED_CNI_VERSION};

/// CHECK only exists from this version on.
const CHECK_MIN_VERSION: Version = Version::new(0, 4, 0);

/// Accepts the config version when this plugin speaks it and `command`
/// exists in it.
pub fn negotiate(requested: &Version, command: Command) -> Result<()> {
    if !SUPPORTED_CNI_VERSION.contains(requested) {
        return Err(Error::IncompatibleVersion(requested.clone()));
    }
    let min = match command {
        Command::Check => Some(CHECK_MIN_VERSION),
        Command::Status | Command::Gc => Some(Version::new(1, 1, 0)),
        _ => None,
    };
    if let Some(min) = min
        && *requested < min
    {
        return Err(Error::IncompatibleVersion(requested.clone()));
    }
    Ok(())
}

/// The version an error envelope is written in: the caller's when it can be
/// read out of the input, ours otherwise.
pub fn reply_version(input: &str) -> Version {
    #[derive(Deserialize)]
    #[serde(rename_all = "camelCase")]
    struct Versioned {
        cni_version: String,
    }
    serde_json::from_str::<Versioned>(input)
        .ok()
        .and_then(|v| v.cni_version.parse().ok())
        .unwrap_or(CNI_VERSION)
}

pub fn version(input: &str) -> Response {
    info!("version called");
    Response::Version(VersionResponse {
        cni_version: reply_version(input),
        supported_versions: SUPPORTED_CNI_VERSION.to_vec(),
    })
}
