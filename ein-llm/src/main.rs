use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use ein_llm::bridge::ExecutionBridge;
use ein_llm::config::{CliArgs, Command, LogLevel, ServeArgs, WorkerArgs};
use ein_llm::hooks::CallbackManager;
use ein_llm::http::{self, AppState, HttpOptions, ServerHandle};
use ein_llm::logging::init_logging;
use ein_llm::models::load_generator;
use ein_llm::pool::{PoolConfig, WorkerCommand, WorkerPool};
use ein_llm::worker::WorkerServer;

fn main() -> Result<()> {
    let args = CliArgs::parse();
    init_logging(args.log_level, args.log_json);

    match args.command {
        Command::Worker(worker) => run_worker(worker),
        Command::Serve(serve) => {
            // Request handling runs on a single-threaded event loop; inference
            // happens in the worker processes.
            let runtime = tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
                .context("building tokio runtime")?;
            runtime.block_on(run_server(serve, args.log_level, args.log_json))
        }
    }
}

fn run_worker(args: WorkerArgs) -> Result<()> {
    // Stdout carries the protocol; logs go to stderr.
    let generator = load_generator(&args.model)?;
    let callbacks = CallbackManager::with_logging(true);
    let mut server = WorkerServer::new(generator, callbacks);
    let stdin = std::io::stdin();
    server.run(stdin.lock())?;
    Ok(())
}

async fn run_server(args: ServeArgs, log_level: LogLevel, log_json: bool) -> Result<()> {
    let mut worker_args = vec!["--log-level".to_string(), log_level.as_arg().to_string()];
    if log_json {
        worker_args.push("--log-json".to_string());
    }
    worker_args.push("worker".to_string());
    worker_args.extend(args.model.to_worker_args());

    let config = PoolConfig::new(WorkerCommand::current_exe(worker_args)?)
        .with_size(args.workers)
        .with_restart(args.restart)
        .with_job_timeout(args.job_timeout())
        .with_start_timeout(args.start_timeout());

    tracing::info!(
        backend = args.model.backend.as_str(),
        workers = args.workers,
        "Starting worker pool"
    );
    let pool = Arc::new(WorkerPool::start(config).await?);

    let bridge = ExecutionBridge::new(pool.clone(), Arc::new(CallbackManager::with_logging(true)));
    let options = HttpOptions {
        static_dir: args.static_dir.clone(),
        cors: !args.no_cors,
    };
    let router = http::router(AppState { bridge }, &options);

    let addr: SocketAddr = tokio::net::lookup_host((args.host.as_str(), args.port))
        .await?
        .next()
        .with_context(|| format!("could not resolve {}:{}", args.host, args.port))?;
    let mut server = ServerHandle::start(router, addr).await?;
    eprintln!("ein-llm listening on http://{}", server.local_addr());

    shutdown_signal().await;

    server.stop().await;
    let stats = pool.stats();
    tracing::info!(
        completed = stats.completed,
        restarts = stats.restarts,
        live_workers = stats.live_workers,
        "Shutting down worker pool"
    );
    pool.shutdown().await;
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => tracing::info!("Received Ctrl+C, shutting down"),
        () = terminate => tracing::info!("Received SIGTERM, shutting down"),
    }
}
