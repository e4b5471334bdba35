//! Server and worker-process wiring.

use std::io::{self, BufReader};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use pilot_cockpit::{CockpitServer, StaticServer};
use pilot_kernel::{ServiceSupervisor, WorkerLauncher, run_child, wait_for_termination};
use pilot_middleware::{EventQueue, EventReceiver};
use pilot_services::{DefaultServiceFactory, SettingsStore};
use pilot_types::{EventTag, PilotError};
use tracing::{error, info, warn};

use crate::config::AppConfig;

const RUNTIME_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(2);

/// Launch the services, serve the UI until a termination signal, then stop
/// every worker.
pub fn run_server(cfg: &AppConfig, settings: SettingsStore, config_arg: Option<&Path>) -> Result<(), PilotError> {
    let factory = DefaultServiceFactory::new(settings);
    let (sender, receiver) = EventQueue::new().split();

    let launcher = match WorkerLauncher::current_exe(worker_args(config_arg)) {
        Ok(launcher) => Some(launcher),
        Err(e) => {
            warn!(error = %e, "cannot locate own executable, process-isolated services run on threads");
            None
        }
    };

    let supervisor = Arc::new(ServiceSupervisor::start(
        &cfg.service_specs(),
        &factory,
        launcher.as_ref(),
        sender,
        cfg.shutdown_grace(),
    ));
    info!(status = %supervisor.status(), "service fleet");

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(|e| PilotError::Io(format!("failed to build async runtime: {e}")))?;
    let result = runtime.block_on(serve(cfg, receiver, supervisor.clone()));
    runtime.shutdown_timeout(RUNTIME_SHUTDOWN_TIMEOUT);

    info!("stopping services");
    supervisor.shutdown();
    info!("pilot-drive stopped");
    result
}

fn worker_args(config_arg: Option<&Path>) -> Vec<String> {
    config_arg
        .map(|path| vec!["--config".to_string(), path.display().to_string()])
        .unwrap_or_default()
}

async fn serve(cfg: &AppConfig, receiver: EventReceiver, supervisor: Arc<ServiceSupervisor>) -> Result<(), PilotError> {
    let cockpit = CockpitServer::new(receiver, supervisor.dispatch(), supervisor)
        .with_port(cfg.ws_port)
        .with_poll_interval(cfg.poll_interval());
    let static_files = StaticServer::new(cfg.static_dir.clone()).with_port(cfg.static_port);

    // Static server failure is logged, not fatal.
    tokio::spawn(async move {
        if let Err(e) = static_files.run().await {
            error!(error = %e, "static UI server stopped");
        }
    });

    tokio::select! {
        result = cockpit.run() => {
            if let Err(ref e) = result {
                error!(error = %e, "WebSocket server stopped");
            }
            result
        }
        signal = wait_for_termination() => signal,
    }
}

/// `--worker <tag>`: host one Service for a parent supervisor over
/// stdin/stdout.
pub fn run_worker(tag: &str, settings: SettingsStore) -> Result<(), PilotError> {
    let tag: EventTag = tag.parse()?;
    let factory = DefaultServiceFactory::new(settings);
    run_child(tag, &factory, BufReader::new(io::stdin()), io::stdout())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn worker_args_forward_explicit_config() {
        assert!(worker_args(None).is_empty());
        assert_eq!(
            worker_args(Some(Path::new("/etc/pd.toml"))),
            vec!["--config".to_string(), "/etc/pd.toml".to_string()]
        );
    }

    #[test]
    fn worker_rejects_unknown_tag() {
        let settings = SettingsStore::with_defaults("/nonexistent/settings.json");
        assert!(matches!(run_worker("warp", settings), Err(PilotError::UnknownTag(_))));
    }
}
