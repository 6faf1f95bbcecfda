//! Daemon command: list sync, enforcement backends and DDoS rules.

use anyhow::{Context, Result};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::clock;
use crate::cmd_abstraction::{CommandExecutor, RealCommandExecutor};
use crate::config::{Config, DdosConfig};
use crate::control_plane::HttpControlPlane;
use crate::ddos::{ApplyRequest, DdosReconciler};
use crate::enforcer::{check_root, ActionContext, ActionManager, ActionRegistry};
use crate::iplist::ListManager;
use crate::lock::LockGuard;
use crate::signal::{spawn_signal_handler, ShutdownToken};
use crate::store::ItemStore;
use crate::sync::ListSyncEngine;

/// Input of the DDoS task.
#[derive(Debug, Clone)]
pub enum DdosEvent {
    /// Configuration (re)loaded
    Reload(DdosConfig),
    /// nftables tables became usable
    Ready,
}

/// Run the daemon until SIGINT/SIGTERM.
pub async fn run(config_path: &Path) -> Result<()> {
    check_root()?;

    let config = Config::load(config_path)
        .with_context(|| format!("Failed to load config from {:?}", config_path))?;
    let _lock = LockGuard::acquire(&config.lock_file)?;

    let shutdown = ShutdownToken::new();
    let (reload_tx, mut reload_rx) = mpsc::channel(4);
    spawn_signal_handler(shutdown.clone(), reload_tx);
    let ticker = clock::spawn_ticker(shutdown.clone());

    let executor: Arc<dyn CommandExecutor> = Arc::new(RealCommandExecutor::with_timeout(
        Duration::from_secs(config.command_timeout_secs),
    ));

    let lists = Arc::new(ListManager::new());
    let actions = Arc::new(ActionManager::new(ActionRegistry::new(ActionContext::new(
        Arc::clone(&executor),
    ))));
    let control_plane = Arc::new(HttpControlPlane::new(&config.control_plane)?);
    let store = ItemStore::open(&config.state_file)?;
    let engine = Arc::new(ListSyncEngine::new(
        control_plane,
        lists,
        Arc::clone(&actions),
        store,
        config.sync.page_size,
        Duration::from_secs(config.sync.interval_secs),
    ));
    engine.load().await;

    info!(
        "edgeacl {} started (node {}, polling every {}s)",
        env!("CARGO_PKG_VERSION"),
        config.control_plane.node_id,
        config.sync.interval_secs
    );

    let sync_task = {
        let engine = Arc::clone(&engine);
        let shutdown = shutdown.clone();
        tokio::spawn(async move { engine.run(shutdown).await })
    };

    let reconciler = Arc::new(DdosReconciler::new(executor));
    let (ddos_tx, ddos_rx) = mpsc::channel(8);
    let ddos_task = tokio::spawn(drive_ddos(
        Arc::clone(&reconciler),
        ddos_rx,
        shutdown.clone(),
    ));
    send_ddos_config(&reconciler, &ddos_tx, config.ddos.clone()).await;

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            Some(()) = reload_rx.recv() => {
                info!("Reloading configuration from {:?}", config_path);
                match Config::load(config_path) {
                    Ok(new_config) => {
                        send_ddos_config(&reconciler, &ddos_tx, new_config.ddos).await;
                    }
                    Err(e) => error!("Config reload failed, keeping current settings: {:#}", e),
                }
                engine.trigger();
            }
        }
    }

    info!("Shutting down...");
    for (name, task) in [("sync", sync_task), ("ddos", ddos_task), ("clock", ticker)] {
        if let Err(e) = task.await {
            warn!("{} task ended abnormally: {}", name, e);
        }
    }
    actions.close_all().await;
    info!("Stopped");
    Ok(())
}

/// Hand a DDoS configuration to the DDoS task, probing nft readiness first.
async fn send_ddos_config(
    reconciler: &DdosReconciler,
    tx: &mpsc::Sender<DdosEvent>,
    config: DdosConfig,
) {
    let enabled = config.enabled;
    if tx.send(DdosEvent::Reload(config)).await.is_err() || !enabled || reconciler.is_ready() {
        return;
    }
    match reconciler.ensure_ready().await {
        Ok(true) => {
            let _ = tx.send(DdosEvent::Ready).await;
        }
        Ok(false) => {}
        Err(e) => warn!("Failed to prepare DDoS tables: {:#}", e),
    }
}

/// Own the reconciler: apply on every reload and ready event.
pub async fn drive_ddos(
    reconciler: Arc<DdosReconciler>,
    mut events: mpsc::Receiver<DdosEvent>,
    shutdown: ShutdownToken,
) {
    loop {
        let event = tokio::select! {
            _ = shutdown.cancelled() => break,
            event = events.recv() => match event {
                Some(event) => event,
                None => break,
            },
        };
        let result = match event {
            DdosEvent::Reload(config) if !config.enabled => {
                debug!("DDoS protection disabled");
                continue;
            }
            DdosEvent::Reload(config) => reconciler.apply(ApplyRequest::from_config(&config)).await,
            DdosEvent::Ready => reconciler.on_ready().await,
        };
        match result {
            Ok(outcome) => debug!("DDoS apply: {:?}", outcome),
            Err(e) => error!("DDoS apply failed: {:#}", e),
        }
    }
    debug!("DDoS task stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cmd_abstraction::CommandOutput;
    use crate::enforcer::testing::RecordingExecutor;

    fn nft_executor() -> Arc<RecordingExecutor> {
        Arc::new(RecordingExecutor::with_responder(|_, args| {
            if args.first().map(String::as_str) == Some("-j") {
                return Ok(CommandOutput::ok(r#"{"nftables": []}"#));
            }
            Ok(CommandOutput::ok(""))
        }))
    }

    fn enabled() -> DdosConfig {
        DdosConfig {
            enabled: true,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_reload_waits_for_ready() {
        let executor = nft_executor();
        let reconciler = Arc::new(DdosReconciler::new(executor.clone()));
        let (tx, rx) = mpsc::channel(8);
        let shutdown = ShutdownToken::new();
        let task = tokio::spawn(drive_ddos(Arc::clone(&reconciler), rx, shutdown.clone()));

        tx.send(DdosEvent::Reload(enabled())).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(executor.count(), 0);

        tx.send(DdosEvent::Ready).await.unwrap();
        drop(tx);
        task.await.unwrap();
        assert!(reconciler.is_ready());
        assert!(executor.lines().iter().any(|l| l.contains("add rule ip edgeacl_ddos")));
    }

    #[tokio::test]
    async fn test_disabled_config_is_not_applied() {
        let executor = nft_executor();
        let reconciler = Arc::new(DdosReconciler::new(executor.clone()));
        reconciler.on_ready().await.unwrap();
        let (tx, rx) = mpsc::channel(8);
        let task = tokio::spawn(drive_ddos(reconciler, rx, ShutdownToken::new()));

        tx.send(DdosEvent::Reload(DdosConfig::default())).await.unwrap();
        drop(tx);
        task.await.unwrap();
        assert_eq!(executor.count(), 0);
    }

    #[tokio::test]
    async fn test_send_config_checks_readiness() {
        let executor = nft_executor();
        let reconciler = DdosReconciler::new(executor.clone());
        let (tx, mut rx) = mpsc::channel(8);

        send_ddos_config(&reconciler, &tx, enabled()).await;
        assert!(matches!(rx.recv().await, Some(DdosEvent::Reload(_))));
        assert!(matches!(rx.recv().await, Some(DdosEvent::Ready)));
        assert!(reconciler.is_ready());

        // Already ready: only the reload is sent.
        send_ddos_config(&reconciler, &tx, enabled()).await;
        drop(tx);
        assert!(matches!(rx.recv().await, Some(DdosEvent::Reload(_))));
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_drive_stops_on_shutdown() {
        let reconciler = Arc::new(DdosReconciler::new(nft_executor()));
        let (_tx, rx) = mpsc::channel::<DdosEvent>(8);
        let shutdown = ShutdownToken::new();
        let task = tokio::spawn(drive_ddos(reconciler, rx, shutdown.clone()));
        shutdown.cancel();
        tokio::time::timeout(Duration::from_secs(5), task)
            .await
            .unwrap()
            .unwrap();
    }
}
