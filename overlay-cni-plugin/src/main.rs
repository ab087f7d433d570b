use std::io::Read;
use std::path::{Path, PathBuf};
use std::process::ExitCode;

use clap::Parser;
use overlay_cni_ipam::EtcdStore;
use overlay_cni_plugin::config::Args;
use overlay_cni_plugin::dispatch::dispatch;
use overlay_cni_plugin::modes::ModeRegistry;
use overlay_cni_plugin::types::{DEFAULT_LOG_DIR, NetConf};
use overlay_cni_plugin::version::reply_version;
use overlay_cni_plugin::{CNI_VERSION, Error, Result, context};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

fn main() -> ExitCode {
    let args = match Args::try_parse() {
        Ok(args) => args,
        Err(e) => {
            return Error::InvalidRequiredEnvVariables(e.to_string())
                .into_response(CNI_VERSION)
                .write_out();
        }
    };
    let input = match read_input() {
        Ok(input) => input,
        Err(e) => return e.into_response(CNI_VERSION).write_out(),
    };
    let _guard = setup_logging(&log_dir(&input));

    let runtime = match tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(e) => return Error::from(e).into_response(reply_version(&input)).write_out(),
    };
    let registry = match ModeRegistry::<EtcdStore>::builtin() {
        Ok(registry) => registry,
        Err(e) => return e.into_response(reply_version(&input)).write_out(),
    };

    let resp = runtime.block_on(dispatch(&registry, &args, &input, context::connect));
    resp.write_out()
}

fn read_input() -> Result<String> {
    let mut buf = String::new();
    std::io::stdin().read_to_string(&mut buf)?;
    Ok(buf)
}

/// `logDir` from the config when it can be read, the default otherwise.
fn log_dir(input: &str) -> PathBuf {
    serde_json::from_str::<NetConf>(input)
        .map(|conf| conf.log_dir)
        .unwrap_or_else(|_| PathBuf::from(DEFAULT_LOG_DIR))
}

/// stdout carries the result, so logs only ever go to the file. A log
/// directory that cannot be created leaves the plugin silent rather than
/// failing the command.
fn setup_logging(dir: &Path) -> Option<WorkerGuard> {
    let file_appender = RollingFileAppender::builder()
        .rotation(Rotation::DAILY)
        .filename_prefix("cni.log")
        .build(dir)
        .ok()?;
    let (nonblocking, guard) = tracing_appender::non_blocking(file_appender);
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                "overlay_cni_plugin=info,overlay_cni_ipam=info,overlay_cni_agent=info".into()
            }),
        )
        .with(
            tracing_subscriber::fmt::layer()
                .with_ansi(false)
                .with_writer(nonblocking),
        )
        .init();
    Some(guard)
}
