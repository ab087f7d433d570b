//! Discovery of the store endpoint and the client certificates used to reach
//! it, derived from the node's kubeconfig.

use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use serde::Deserialize;
use tracing::{debug, info};

use crate::kv::etcd::{EtcdConfig, TlsMaterials};
use crate::{Error, Result};

pub const ETCD_ENDPOINT_ENV: &str = "ETCD_ENDPOINT";
pub const ETCD_PORT: u16 = 2379;
pub const MATERIALS_DIR: &str = "/etc/overlay-cni/pki";
pub const ETCD_PKI_DIR: &str = "/etc/kubernetes/pki/etcd";
/// Checked in order, followed by `~/.kube/config`.
pub const KUBECONFIG_PATHS: [&str; 2] = [
    "/etc/kubernetes/admin.conf",
    "/etc/kubernetes/kubelet.conf",
];
/// Cluster CA installed by kubeadm, preferred over inline data.
pub const KUBE_CA_PATH: &str = "/etc/kubernetes/pki/ca.crt";

const CA_FILE: &str = "ca.crt";
const CERT_FILE: &str = "client.crt";
const KEY_FILE: &str = "client.key";

#[derive(Deserialize, Debug, Default)]
struct KubeconfigFile {
    #[serde(default)]
    clusters: Vec<NamedCluster>,
    #[serde(default)]
    users: Vec<NamedUser>,
}

#[derive(Deserialize, Debug)]
struct NamedCluster {
    cluster: ClusterEntry,
}

#[derive(Deserialize, Debug)]
struct ClusterEntry {
    server: String,
    #[serde(rename = "certificate-authority")]
    certificate_authority: Option<PathBuf>,
    #[serde(rename = "certificate-authority-data")]
    certificate_authority_data: Option<String>,
}

#[derive(Deserialize, Debug)]
struct NamedUser {
    user: UserEntry,
}

#[derive(Deserialize, Debug, Default)]
struct UserEntry {
    #[serde(rename = "client-certificate")]
    client_certificate: Option<PathBuf>,
    #[serde(rename = "client-certificate-data")]
    client_certificate_data: Option<String>,
    #[serde(rename = "client-key")]
    client_key: Option<PathBuf>,
    #[serde(rename = "client-key-data")]
    client_key_data: Option<String>,
}

/// A credential either embedded in the kubeconfig or referenced by path.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Material {
    Inline(Vec<u8>),
    File(PathBuf),
}

#[derive(Clone, Debug)]
pub struct Kubeconfig {
    pub path: PathBuf,
    pub server: String,
    pub ca: Option<Material>,
    pub cert: Option<Material>,
    pub key: Option<Material>,
}

/// First kubeconfig present on the node.
pub fn find_kubeconfig(home: Option<&Path>) -> Option<PathBuf> {
    let mut candidates: Vec<PathBuf> = KUBECONFIG_PATHS.iter().map(PathBuf::from).collect();
    if let Some(home) = home {
        candidates.push(home.join(".kube").join("config"));
    }
    candidates.into_iter().find(|p| p.is_file())
}

pub fn read_kubeconfig(path: &Path) -> Result<Kubeconfig> {
    let raw = fs::read_to_string(path)?;
    let parsed: KubeconfigFile = serde_yaml::from_str(&raw)?;
    let base = path.parent().unwrap_or(Path::new("/"));
    let cluster = parsed
        .clusters
        .into_iter()
        .next()
        .ok_or_else(|| Error::Config(format!("{} has no clusters", path.display())))?
        .cluster;
    let user = parsed
        .users
        .into_iter()
        .next()
        .map(|u| u.user)
        .unwrap_or_default();

    Ok(Kubeconfig {
        path: path.to_path_buf(),
        server: cluster.server,
        ca: material(
            base,
            cluster.certificate_authority_data,
            cluster.certificate_authority,
        )?,
        cert: material(base, user.client_certificate_data, user.client_certificate)?,
        key: material(base, user.client_key_data, user.client_key)?,
    })
}

fn material(base: &Path, data: Option<String>, file: Option<PathBuf>) -> Result<Option<Material>> {
    if let Some(data) = data
        && !data.trim().is_empty()
    {
        return Ok(Some(Material::Inline(BASE64.decode(data.trim())?)));
    }
    Ok(file.map(|f| {
        if f.is_absolute() {
            Material::File(f)
        } else {
            Material::File(base.join(f))
        }
    }))
}

/// Writes the kubeconfig credentials under `dir` as `ca.crt`, `client.crt`
/// and `client.key`. Files that already match are left untouched.
pub fn materialize(
    kubeconfig: &Kubeconfig,
    dir: &Path,
    cluster_ca: Option<&Path>,
) -> Result<TlsMaterials> {
    fs::create_dir_all(dir)?;
    let out = TlsMaterials {
        ca: dir.join(CA_FILE),
        cert: dir.join(CERT_FILE),
        key: dir.join(KEY_FILE),
    };
    let ca = match cluster_ca.filter(|p| p.is_file()) {
        Some(path) => Some(Material::File(path.to_path_buf())),
        None => kubeconfig.ca.clone(),
    };
    let missing = |what: &str| {
        Error::Config(format!(
            "{} has no {what}",
            kubeconfig.path.display()
        ))
    };
    let written = [
        write_material(ca.as_ref().ok_or_else(|| missing("certificate authority"))?, &out.ca, 0o644)?,
        write_material(
            kubeconfig.cert.as_ref().ok_or_else(|| missing("client certificate"))?,
            &out.cert,
            0o644,
        )?,
        write_material(
            kubeconfig.key.as_ref().ok_or_else(|| missing("client key"))?,
            &out.key,
            0o600,
        )?,
    ];
    let written = written.iter().filter(|w| **w).count();
    if written > 0 {
        info!(dir = %dir.display(), written, "materialized client credentials");
    } else {
        debug!(dir = %dir.display(), "credentials already materialized");
    }
    Ok(out)
}

/// Writes `material` to `dst` unless it already holds the same bytes, so a
/// rotated certificate replaces the old one.
fn write_material(material: &Material, dst: &Path, mode: u32) -> Result<bool> {
    let bytes = match material {
        Material::Inline(bytes) => bytes.clone(),
        Material::File(src) => fs::read(src)?,
    };
    let unchanged = match fs::read(dst) {
        Ok(current) => current == bytes,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => false,
        Err(e) => return Err(e.into()),
    };
    if !unchanged {
        fs::write(dst, &bytes)?;
    }
    fs::set_permissions(dst, fs::Permissions::from_mode(mode))?;
    Ok(!unchanged)
}

/// Store endpoint on the api server host: `https://<host>:2379`.
pub fn endpoint_from_server(server: &str) -> Result<String> {
    let uri: http::Uri = server
        .parse()
        .map_err(|e| Error::Config(format!("api server url {server}: {e}")))?;
    match uri.host().filter(|h| !h.is_empty()) {
        Some(host) => Ok(format!("https://{host}:{ETCD_PORT}")),
        None => Err(Error::Config(format!("no host in api server url {server}"))),
    }
}

/// Locations consulted by [`discover`].
#[derive(Clone, Debug)]
pub struct Discovery {
    pub endpoint: Option<String>,
    pub home: Option<PathBuf>,
    pub etcd_pki_dir: PathBuf,
    pub materials_dir: PathBuf,
    pub cluster_ca: PathBuf,
}

impl Default for Discovery {
    fn default() -> Self {
        Self {
            endpoint: std::env::var(ETCD_ENDPOINT_ENV)
                .ok()
                .filter(|e| !e.is_empty()),
            home: std::env::var_os("HOME").map(PathBuf::from),
            etcd_pki_dir: PathBuf::from(ETCD_PKI_DIR),
            materials_dir: PathBuf::from(MATERIALS_DIR),
            cluster_ca: PathBuf::from(KUBE_CA_PATH),
        }
    }
}

/// Builds the store connection settings.
///
/// The endpoint comes from the override when set, otherwise from the api
/// server host of the first kubeconfig found. The etcd healthcheck client
/// certificate is used when the node carries one; otherwise the kubeconfig
/// credentials are materialized and used instead.
pub fn discover(discovery: &Discovery) -> Result<EtcdConfig> {
    let load_kubeconfig = || -> Result<Kubeconfig> {
        let path = find_kubeconfig(discovery.home.as_deref()).ok_or_else(|| {
            Error::Config(format!(
                "no kubeconfig found and {ETCD_ENDPOINT_ENV} is not set"
            ))
        })?;
        read_kubeconfig(&path)
    };

    let mut kubeconfig = None;
    let endpoint = match &discovery.endpoint {
        Some(endpoint) => endpoint.clone(),
        None => {
            let loaded = load_kubeconfig()?;
            let endpoint = endpoint_from_server(&loaded.server)?;
            kubeconfig = Some(loaded);
            endpoint
        }
    };
    if endpoint.starts_with("http://") {
        return Ok(EtcdConfig::new(endpoint, None));
    }

    let etcd_pki = TlsMaterials {
        ca: discovery.etcd_pki_dir.join("ca.crt"),
        cert: discovery.etcd_pki_dir.join("healthcheck-client.crt"),
        key: discovery.etcd_pki_dir.join("healthcheck-client.key"),
    };
    let tls = if etcd_pki.ca.is_file() && etcd_pki.cert.is_file() && etcd_pki.key.is_file() {
        etcd_pki
    } else {
        let kubeconfig = match kubeconfig {
            Some(kubeconfig) => kubeconfig,
            None => load_kubeconfig()?,
        };
        materialize(
            &kubeconfig,
            &discovery.materials_dir,
            Some(&discovery.cluster_ca),
        )?
    };
    Ok(EtcdConfig::new(endpoint, Some(tls)))
}

#[cfg(test)]
mod test {
    use super::*;

    const KUBECONFIG: &str = r#"
apiVersion: v1
kind: Config
clusters:
- name: kubernetes
  cluster:
    server: https://192.168.64.19:6443
    certificate-authority-data: Y2EtYnl0ZXM=
users:
- name: admin
  user:
    client-certificate-data: Y2VydC1ieXRlcw==
    client-key: keys/admin.key
"#;

    #[test]
    fn test_endpoint_from_server() -> Result<()> {
        assert_eq!(
            endpoint_from_server("https://192.168.64.19:6443")?,
            "https://192.168.64.19:2379"
        );
        assert_eq!(
            endpoint_from_server("https://control-plane/")?,
            "https://control-plane:2379"
        );
        assert_eq!(
            endpoint_from_server("https://[fd00::19]:6443")?,
            "https://[fd00::19]:2379"
        );
        assert!(endpoint_from_server("https://").is_err());
        assert!(endpoint_from_server("not a url").is_err());
        Ok(())
    }

    #[test]
    fn test_read_kubeconfig_inline_and_relative_file() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("admin.conf");
        fs::write(&path, KUBECONFIG)?;

        let kubeconfig = read_kubeconfig(&path)?;
        assert_eq!(kubeconfig.server, "https://192.168.64.19:6443");
        assert_eq!(kubeconfig.ca, Some(Material::Inline(b"ca-bytes".to_vec())));
        assert_eq!(
            kubeconfig.cert,
            Some(Material::Inline(b"cert-bytes".to_vec()))
        );
        assert_eq!(
            kubeconfig.key,
            Some(Material::File(dir.path().join("keys/admin.key")))
        );
        Ok(())
    }

    #[test]
    fn test_materialize_decodes_and_copies() -> Result<()> {
        let dir = tempfile::tempdir()?;
        fs::create_dir_all(dir.path().join("keys"))?;
        fs::write(dir.path().join("keys/admin.key"), "key-bytes")?;
        let path = dir.path().join("admin.conf");
        fs::write(&path, KUBECONFIG)?;
        let kubeconfig = read_kubeconfig(&path)?;

        let out_dir = dir.path().join("pki");
        let materials = materialize(&kubeconfig, &out_dir, None)?;
        assert_eq!(fs::read(&materials.ca)?, b"ca-bytes");
        assert_eq!(fs::read(&materials.cert)?, b"cert-bytes");
        assert_eq!(fs::read(&materials.key)?, b"key-bytes");
        let mode = fs::metadata(&materials.key)?.permissions().mode() & 0o777;
        assert_eq!(mode, 0o600);
        Ok(())
    }

    #[test]
    fn test_materialize_replaces_rotated_key() -> Result<()> {
        let dir = tempfile::tempdir()?;
        fs::create_dir_all(dir.path().join("keys"))?;
        fs::write(dir.path().join("keys/admin.key"), "key-bytes")?;
        let path = dir.path().join("admin.conf");
        fs::write(&path, KUBECONFIG)?;
        let kubeconfig = read_kubeconfig(&path)?;
        let out_dir = dir.path().join("pki");
        materialize(&kubeconfig, &out_dir, None)?;

        fs::write(dir.path().join("keys/admin.key"), "rotated-key")?;
        let materials = materialize(&kubeconfig, &out_dir, None)?;
        assert_eq!(fs::read(&materials.key)?, b"rotated-key");
        assert_eq!(fs::read(&materials.cert)?, b"cert-bytes");
        Ok(())
    }

    #[test]
    fn test_discover_prefers_override_and_plain_http() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let discovery = Discovery {
            endpoint: Some("http://127.0.0.1:2379".into()),
            home: Some(dir.path().to_path_buf()),
            etcd_pki_dir: dir.path().join("etcd"),
            materials_dir: dir.path().join("pki"),
            cluster_ca: dir.path().join("ca.crt"),
        };
        let config = discover(&discovery)?;
        assert_eq!(config.endpoints, vec!["http://127.0.0.1:2379".to_string()]);
        assert!(config.tls.is_none());
        Ok(())
    }
}
