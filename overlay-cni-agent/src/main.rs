use std::path::Path;
use std::sync::Arc;

use clap::Parser;
use overlay_cni_agent::bpf::{PodMapState, open_pod_map};
use overlay_cni_agent::config::{self, Cli, Commands, ReconcileArgs, TeardownArgs};
use overlay_cni_agent::kubernetes::{self, KubeNodeResolver};
use overlay_cni_agent::reconciler::Reconciler;
use overlay_cni_agent::{Result, http, lock};
use tokio::task::JoinError;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    match cli.command {
        Commands::Reconcile(args) => {
            let _guard = setup_subscriber(&args.log_dir);
            reconcile(args).await?;
        }
        Commands::Teardown(args) => {
            let _guard = setup_subscriber(&args.log_dir);
            teardown(args).await?;
        }
    }
    Ok(())
}

async fn reconcile(args: ReconcileArgs) -> Result<()> {
    let Some(_lock) = lock::acquire(&args.lock_file, &args.pid_file)? else {
        info!("reconciler already running");
        return Ok(());
    };

    let ipam = args.kv.connect().await?;
    let pod_map = PodMapState::new(open_pod_map(&args.bpf_fs)?);
    let resolver = KubeNodeResolver::new(kubernetes::client().await?);
    let reconciler = Reconciler::new(ipam, resolver, pod_map);

    let cancel = CancellationToken::new();
    let ready = CancellationToken::new();
    let health_state = Arc::new(http::State::new(ready.clone()));
    let mut health_handle = tokio::spawn(http::serve(
        args.health_address,
        health_state,
        cancel.child_token(),
    ));
    let mut reconciler_handle = tokio::spawn(reconciler.run(ready, cancel.child_token()));
    let mut shutdown_handle = tokio::spawn(async move { shutdown_signal().await });
    // watch for shutdown and errors
    tokio::select! {
        h = &mut health_handle => {
            exit("health", h);
            cancel.cancel();
            if let Err(e) = reconciler_handle.await {
                error!("reconciler exited with error: {}", e.to_string());
            }
        },
        h = &mut reconciler_handle => {
            exit("reconciler", h);
            cancel.cancel();
            if let Err(e) = health_handle.await {
                error!("health exited with error: {}", e.to_string());
            }
        },
        _ = &mut shutdown_handle => {
                cancel.cancel();
                let (health, reconciler) = tokio::join!(health_handle, reconciler_handle);
                if let Err(h) = health {
                    error!("health exited with error: {}", h.to_string());
                }
                if let Err(r) = reconciler {
                    error!("reconciler exited with error: {}", r.to_string());
                }
            },
    };
    info!("Exiting...");
    Ok(())
}

async fn teardown(args: TeardownArgs) -> Result<()> {
    let ipam = args.kv.connect().await?;
    match ipam.teardown().await? {
        Some(block) => info!(node = ipam.node(), %block, "node torn down"),
        None => info!(node = ipam.node(), "node holds no block"),
    }
    Ok(())
}

/// The daemon is detached from any terminal, so everything also goes to a
/// daily file. A log directory that cannot be written leaves stderr only.
fn setup_subscriber(log_dir: &Path) -> Option<WorkerGuard> {
    let (file_layer, guard) = match config::log_file(log_dir) {
        Ok(appender) => {
            let (nonblocking, guard) = tracing_appender::non_blocking(appender);
            let layer = tracing_subscriber::fmt::layer()
                .with_ansi(false)
                .with_writer(nonblocking);
            (Some(layer), Some(guard))
        }
        Err(e) => {
            eprintln!("logging to stderr only, {}: {e}", log_dir.display());
            (None, None)
        }
    };
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "overlay_cni_agent=info,overlay_cni_ipam=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(file_layer)
        .init();
    guard
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };
    tokio::select! {
        _ = ctrl_c => {
          info!("captured ctrl_c signal");
        },
        _ = terminate => {},
    }
}

fn exit(task: &str, out: Result<Result<()>, JoinError>) {
    match out {
        Ok(Ok(_)) => {
            info!("{task} exited")
        }
        Ok(Err(e)) => {
            error!("{task} failed with error: {e}")
        }
        Err(e) => {
            error!("{task} task failed to complete: {e}")
        }
    }
}
