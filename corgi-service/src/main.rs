//! Binary entrypoint: configuration, tracing, state, jobs, server

use tokio_util::sync::CancellationToken;

use corgi_service::jobs::scheduler;
use corgi_service::prelude::*;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Fails closed: a production environment with a default salt or the
    // development identity bypass refuses to start.
    let config = Config::load()?;

    init_tracing(&config)?;

    let shutdown = CancellationToken::new();
    let (state, runner) = AppState::build(config, shutdown.clone()).await?;

    let workers = runner.spawn_workers();
    let schedules = scheduler::spawn(
        state.jobs().clone(),
        state.config().clone(),
        shutdown.clone(),
    );

    let app = corgi_service::server::router(state.clone());
    Server::new(state.config().clone())
        .serve(app, shutdown.clone())
        .await?;

    // The listener is closed; cancel background work and drain the queue.
    shutdown.cancel();
    for schedule in schedules {
        let _ = schedule.await;
    }
    for worker in workers {
        let _ = worker.await;
    }

    tracing::info!("corgi stopped");
    Ok(())
}
