//! playbox - playground sandbox backend
//!
//! An HTTP server that takes requests containing precompiled
//! `linux/amd64` binaries and executes them inside gVisor-isolated
//! containers.
//!
//! One binary, two roles. `--mode=server` is the outer supervisor: it
//! keeps a pool of pre-warmed containers and exposes `POST /run`.
//! `--mode=contained` is the jailed child that runs as each container's
//! entrypoint, blocked on stdin until the supervisor streams it a binary.

mod api;
mod middleware;
mod state;

use std::net::SocketAddr;

use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use tokio::net::TcpListener;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use playbox_sandbox::{docker, runner, ContainerPool, PoolConfig};

use crate::state::AppState;

#[derive(Parser, Debug)]
#[command(name = "playbox", version, about = "Runs untrusted binaries in gVisor containers")]
struct Args {
    /// Address to listen on (default 0.0.0.0:80, or 127.0.0.1:8080 with --dev).
    #[arg(long)]
    listen: Option<SocketAddr>,

    /// Which half of the binary to run.
    #[arg(long, value_enum, default_value = "server")]
    mode: Mode,

    /// Pre-warmed container count, and the concurrent request cap.
    #[arg(long, default_value_t = default_workers())]
    workers: usize,

    /// Image run for each worker container.
    #[arg(long = "untrusted-container", default_value = docker::DEFAULT_IMAGE)]
    untrusted_container: String,

    /// Verbose per-request logs and a local listen default.
    #[arg(long)]
    dev: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Mode {
    /// The outer supervisor serving POST /run.
    Server,
    /// The jailed child used as the sandbox image's entrypoint.
    Contained,
}

fn default_workers() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    if args.mode == Mode::Contained {
        // stdout and stderr are the wire protocol in this mode: no logger.
        match runner::run_contained().await {
            Ok(code) => std::process::exit(code),
            Err(e) => {
                eprintln!("error running contained process: {e}");
                std::process::exit(1);
            }
        }
    }

    let default_filter = if args.dev {
        "info,playbox_server=debug,playbox_sandbox=debug,tower_http=debug"
    } else {
        "info"
    };
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter)))
        .init();

    info!(
        version = env!("CARGO_PKG_VERSION"),
        workers = args.workers,
        image = %args.untrusted_container,
        "starting sandbox backend"
    );

    // Both checks must pass before the listener opens: a backend that
    // cannot start containers should never look routable.
    docker::check_daemon()
        .await
        .context("container runtime not reachable")?;
    docker::ensure_image(&args.untrusted_container)
        .await
        .context("untrusted container image unavailable")?;

    let pool = ContainerPool::start(PoolConfig::new(
        args.workers,
        args.untrusted_container.clone(),
    ));
    let state = AppState::new(pool);

    let mut app = api::create_router(state)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive());
    if args.dev {
        app = app.layer(axum::middleware::from_fn(middleware::log_requests));
    }

    let addr = args.listen.unwrap_or_else(|| {
        if args.dev {
            SocketAddr::from(([127, 0, 0, 1], 8080))
        } else {
            SocketAddr::from(([0, 0, 0, 0], 80))
        }
    });
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("binding {addr}"))?;
    info!("listening on http://{addr}");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    Ok(())
}

async fn shutdown_signal() {
    if tokio::signal::ctrl_c().await.is_ok() {
        info!("interrupt received; shutting down");
    }
}
