use outpost_core::{
    application::{Application, ApplicationDeps},
    config::RuntimeConfig,
};
use outpost_helpers::env::{EnvVars, ProcessEnvVars};
use tokio::sync::broadcast;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

fn init_tracing(env: &impl EnvVars) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let json_logs = env
        .var("OUTPOST_LOG_FORMAT")
        .map(|format| format == "json")
        .unwrap_or(false);
    if json_logs {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}

async fn shutdown_on_signal(shutdown: broadcast::Sender<()>) {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            error!("failed to listen for ctrl-c: {err}");
        }
    };
    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(err) => error!("failed to listen for SIGTERM: {err}"),
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
    info!("shutdown signal received");
    let _ = shutdown.send(());
}

#[tokio::main]
async fn main() {
    let env = ProcessEnvVars::new();
    init_tracing(&env);

    let config = match RuntimeConfig::from_env(&env) {
        Ok(config) => config,
        Err(err) => {
            error!("{err}");
            std::process::exit(1);
        }
    };

    let (shutdown, _) = broadcast::channel(1);
    tokio::spawn(shutdown_on_signal(shutdown.clone()));

    let application = Application::new(config, ApplicationDeps::in_memory());
    if let Err(err) = application.run(shutdown).await {
        error!("{err}");
        std::process::exit(1);
    }
}
