use std::sync::Arc;

use beacon_control::adapters::{Remotes, SystemClock};
use beacon_control::api::{self, AppState};
use beacon_control::aws_cli::AwsCli;
use beacon_control::config::Config;
use beacon_control::controller::{ControllerSettings, LifecycleController};
use beacon_control::maintenance::MaintenanceScheduler;
use beacon_control::mc_query::QueryClient;
use beacon_control::notify::{NotificationRegistry, WebhookNotifier};
use beacon_control::rcon::RconClient;
use beacon_control::reconcile::Reconciler;
use beacon_control::ssh_launch::SshLauncher;
use beacon_control::status::StatusReporter;

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        tracing::warn!(%err, "failed to listen for ctrl-c");
        std::future::pending::<()>().await;
    }
    tracing::info!("shutdown requested");
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let path = Config::default_path();
    let cfg = Config::load(&path)?;
    tracing::info!(config = %path.display(), instance_id = %cfg.server.instance_id, "config loaded");

    let server = &cfg.server;
    let remotes = Remotes {
        cloud: Arc::new(AwsCli::new(
            server.region.clone(),
            server.aws_profile.clone(),
            server.cloud_call_timeout(),
        )),
        launcher: Arc::new(SshLauncher::new(
            server.ssh_username.clone(),
            server.ssh_key_path.clone(),
            server.remote_call_timeout(),
        )),
        stats: Arc::new(QueryClient::new(server.remote_call_timeout())),
        console: Arc::new(RconClient::new(server.remote_call_timeout())),
    };

    let scheduler = MaintenanceScheduler::new(server.maintenance_hour, server.zone()?);
    let reporter = StatusReporter::new(
        NotificationRegistry::new(),
        Arc::new(WebhookNotifier::new()?),
        server.idle_timeout_minutes,
        scheduler.display_time(),
    );
    let controller = LifecycleController::new(
        ControllerSettings::from_config(server),
        remotes,
        reporter,
        Arc::new(SystemClock),
    );

    let state = controller.bootstrap().await;
    tracing::info!(%state, "controller ready");

    Reconciler::new(controller.clone(), scheduler, cfg.control.reconcile_interval()).spawn();

    let app = api::router(AppState {
        controller,
        command_token: cfg.control.command_token.clone(),
    });

    let addr = cfg.control.listen;
    tracing::info!(%addr, "beacon-control HTTP listening");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    Ok(())
}
