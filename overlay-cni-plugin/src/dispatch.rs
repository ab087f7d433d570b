use std::future::Future;

use overlay_cni_ipam::KvStore;
use tracing::{error, info};

use crate::Result;
use crate::config::{Args, Command};
use crate::context::PluginContext;
use crate::modes::ModeRegistry;
use crate::response::Response;
use crate::types::NetConf;
use crate::version::{negotiate, reply_version, version};

/// Runs one CNI invocation. Every failure is turned into the error envelope,
/// written in the caller's version when it could be read.
///
/// `connect` opens the store and is only called once the config has been
/// validated and the mode is known.
pub async fn dispatch<S, F, Fut>(
    registry: &ModeRegistry<S>,
    args: &Args,
    input: &str,
    connect: F,
) -> Response
where
    S: KvStore,
    F: FnOnce(NetConf) -> Fut,
    Fut: Future<Output = Result<PluginContext<S>>>,
{
    if args.command == Command::Version {
        return version(input);
    }
    match run(registry, args, input, connect).await {
        Ok(response) => response,
        Err(e) => {
            error!(%e, command = ?args.command, container = ?args.container_id, "cni command failed");
            e.into_response(reply_version(input))
        }
    }
}

async fn run<S, F, Fut>(
    registry: &ModeRegistry<S>,
    args: &Args,
    input: &str,
    connect: F,
) -> Result<Response>
where
    S: KvStore,
    F: FnOnce(NetConf) -> Fut,
    Fut: Future<Output = Result<PluginContext<S>>>,
{
    args.validate()?;
    let conf = NetConf::parse(input)?;
    negotiate(&conf.cni_version, args.command)?;
    if matches!(args.command, Command::Status | Command::Gc) {
        return Ok(Response::Empty);
    }

    let mode = registry.get(&conf.mode)?;
    info!(
        command = ?args.command,
        mode = mode.mode_name(),
        container = ?args.container_id,
        "handling cni command"
    );
    let ctx = connect(conf.clone()).await?;
    let response = match args.command {
        Command::Add => Response::Success(mode.bootstrap(&ctx, args, &conf).await?),
        Command::Delete => {
            mode.unmount(&ctx, args, &conf).await?;
            Response::Empty
        }
        Command::Check => {
            mode.check(&ctx, args, &conf).await?;
            Response::Empty
        }
        Command::Status | Command::Gc | Command::Version => Response::Empty,
    };
    Ok(response)
}
