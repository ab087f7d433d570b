use std::ffi::OsString;
use std::os::unix::fs::PermissionsExt;
use std::os::unix::process::CommandExt;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

use overlay_cni_agent::lock::{self, Instance};
use overlay_cni_ipam::KvStore;
use tracing::{debug, info, warn};

use crate::config::Args;
use crate::context::PluginContext;
use crate::types::NetConf;
use crate::{Error, Result};

pub const AGENT_BINARY: &str = "overlay-cni-agent";

/// Starts the reconciler unless one already holds the node lock. Returns the
/// pid of a freshly spawned reconciler.
pub fn ensure_reconciler<S: KvStore>(
    ctx: &PluginContext<S>,
    args: &Args,
    conf: &NetConf,
) -> Result<Option<u32>> {
    match lock::probe(ctx.lock_file(), ctx.pid_file())? {
        Instance::Running { pid: Some(pid) } => {
            debug!(pid, "reconciler already running");
            return Ok(None);
        }
        Instance::Running { pid: None } => {
            warn!(
                "reconciler lock is held but {} names no live process",
                ctx.pid_file().display()
            );
            return Ok(None);
        }
        Instance::Free => {}
    }

    let search_paths = args.search_paths();
    let binary = find_binary(AGENT_BINARY, &search_paths).ok_or_else(|| {
        Error::Fatal(format!("{AGENT_BINARY} not found in CNI_PATH {search_paths:?}"))
    })?;
    let agent_args = agent_args(
        ctx.ipam().node(),
        conf,
        ctx.bpf_fs(),
        ctx.lock_file(),
        ctx.pid_file(),
    );

    let mut command = Command::new(&binary);
    command
        .args(&agent_args)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null());
    // detach from the runtime's session so the reconciler outlives the plugin
    unsafe {
        command.pre_exec(|| {
            nix::unistd::setsid()?;
            Ok(())
        });
    }
    let child = command.spawn()?;
    info!(pid = child.id(), "started {}", binary.display());
    Ok(Some(child.id()))
}

/// Command line for `overlay-cni-agent reconcile` matching this network.
pub fn agent_args(
    node: &str,
    conf: &NetConf,
    bpf_fs: &Path,
    lock_file: &Path,
    pid_file: &Path,
) -> Vec<OsString> {
    let mut args: Vec<OsString> = vec![
        "reconcile".into(),
        "--node-name".into(),
        node.into(),
        "--subnet".into(),
        conf.subnet.clone().into(),
        "--block-prefix".into(),
        conf.block_prefix().to_string().into(),
        "--kv-prefix".into(),
        conf.kv_prefix.clone().into(),
        "--bpf-fs".into(),
        bpf_fs.into(),
        "--lock-file".into(),
        lock_file.into(),
        "--pid-file".into(),
        pid_file.into(),
        "--log-dir".into(),
        conf.log_dir.clone().into(),
    ];
    if let Some(endpoint) = conf.etcd_endpoint.as_ref().filter(|e| !e.is_empty()) {
        args.push("--etcd-endpoint".into());
        args.push(endpoint.into());
    }
    args
}

/// First executable file called `name` in `paths`.
pub fn find_binary(name: &str, paths: &[PathBuf]) -> Option<PathBuf> {
    paths.iter().map(|dir| dir.join(name)).find(|candidate| {
        candidate
            .metadata()
            .map(|m| m.is_file() && m.permissions().mode() & 0o111 != 0)
            .unwrap_or(false)
    })
}

#[cfg(test)]
mod test {
    use std::fs;

    use super::*;

    #[test]
    fn test_agent_args() {
        let conf = NetConf::parse(
            r#"{"cniVersion":"1.0.0","name":"overlay","mode":"vxlan","subnet":"10.244.0.0/16",
                "blockPrefix":26,"etcdEndpoint":"http://127.0.0.1:2379"}"#,
        )
        .unwrap();
        let args = agent_args(
            "node-a",
            &conf,
            Path::new("/sys/fs/bpf"),
            Path::new("/run/r.lock"),
            Path::new("/run/r.pid"),
        );
        let args: Vec<String> = args
            .into_iter()
            .map(|a| a.into_string().unwrap())
            .collect();
        assert_eq!(args[0], "reconcile");
        let flag = |name: &str| {
            let at = args.iter().position(|a| a == name).unwrap();
            args[at + 1].clone()
        };
        assert_eq!(flag("--node-name"), "node-a");
        assert_eq!(flag("--subnet"), "10.244.0.0/16");
        assert_eq!(flag("--block-prefix"), "26");
        assert_eq!(flag("--kv-prefix"), "/cni-demo/ipam");
        assert_eq!(flag("--lock-file"), "/run/r.lock");
        assert_eq!(flag("--etcd-endpoint"), "http://127.0.0.1:2379");

        let conf = NetConf::parse(r#"{"name":"overlay","subnet":"10.244.0.0/16"}"#).unwrap();
        let args = agent_args(
            "node-a",
            &conf,
            Path::new("/sys/fs/bpf"),
            Path::new("/run/r.lock"),
            Path::new("/run/r.pid"),
        );
        assert!(!args.iter().any(|a| a == "--etcd-endpoint"));
    }

    #[test]
    fn test_find_binary() -> Result<()> {
        let first = tempfile::tempdir()?;
        let second = tempfile::tempdir()?;
        let paths = vec![first.path().to_owned(), second.path().to_owned()];
        assert_eq!(find_binary(AGENT_BINARY, &paths), None);

        // not executable
        fs::write(first.path().join(AGENT_BINARY), "")?;
        assert_eq!(find_binary(AGENT_BINARY, &paths), None);

        let binary = second.path().join(AGENT_BINARY);
        fs::write(&binary, "")?;
        fs::set_permissions(&binary, fs::Permissions::from_mode(0o755))?;
        assert_eq!(find_binary(AGENT_BINARY, &paths), Some(binary));
        Ok(())
    }
}
