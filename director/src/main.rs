//! Entry point: wires configuration, installs early-exit signal handling,
//! then builds and runs the director. Mirrors the construction order of the
//! original `__main__.py` (ingress before healthchecker before director).

use clap::Parser;
use director::Config;
use tokio_util::sync::CancellationToken;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    director::logging::init();

    // Before the director installs its own graceful handlers, an early
    // SIGINT/SIGTERM means setup never got far enough to shut down
    // cleanly — exit immediately rather than risk hanging (spec §6; PID 1
    // ignores an unhandled SIGTERM, so this must be handled explicitly).
    // `Director::setup` cancels this guard the moment it installs its own
    // handlers, so a signal after that point only sets the ABORT flag
    // instead of racing this task's `exit(1)`.
    let early_exit_guard = CancellationToken::new();
    tokio::spawn(install_early_exit_guard(early_exit_guard.clone()));

    let config = Config::parse();
    tracing::info!(queue = %config.queue, redis_url = %config.redis_url, "starting director");

    let director = director::Director::build(config, early_exit_guard).await?;
    director.run().await
}

async fn install_early_exit_guard(guard: CancellationToken) {
    #[cfg(unix)]
    {
        let mut terminate = match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
        {
            Ok(signal) => signal,
            Err(err) => {
                tracing::error!(error = %err, "failed to install early SIGTERM guard");
                return;
            }
        };
        tokio::select! {
            _ = guard.cancelled() => {}
            _ = tokio::signal::ctrl_c() => std::process::exit(1),
            _ = terminate.recv() => std::process::exit(1),
        }
    }
    #[cfg(not(unix))]
    {
        tokio::select! {
            _ = guard.cancelled() => {}
            _ = tokio::signal::ctrl_c() => std::process::exit(1),
        }
    }
}
