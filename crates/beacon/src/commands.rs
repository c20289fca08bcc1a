//! Invocation modes.
//!
//! Each mode drives exactly one component against the shared store.

use anyhow::{Context, Result, bail};
use beacon_common::{LivenessTransition, is_valid_segment};
use futures::StreamExt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{info, warn};

use crate::config::AppConfig;
use crate::heartbeat::{HeartbeatConfig, HeartbeatManager};
use crate::mirror::ConfigMirror;
use crate::observer::{Fleet, LivenessObserver};
use crate::store::{KeyStore, SetOptions};

/// Set one config variable for a server
pub async fn set_config<S: KeyStore>(
    store: Arc<S>,
    config: &AppConfig,
    server: &str,
    variable: &str,
    value: &str,
) -> Result<()> {
    if !is_valid_segment(server) || !is_valid_segment(variable) {
        bail!("invalid server or variable name: {:?}/{:?}", server, variable);
    }
    let key = format!(
        "{}/{}/{}",
        config.keys.config_root.trim_end_matches('/'),
        server,
        variable
    );

    let event = store
        .set(&key, value, &SetOptions::default())
        .await
        .with_context(|| format!("Failed to set {}", key))?;

    info!(key = %event.node.key, action = %event.action, "Config variable written");
    println!("{} {} to {}", event.action, event.node.key, event.node.value_str());
    Ok(())
}

/// Mirror one server's config and print every change, until Ctrl+C
pub async fn serve_config<S: KeyStore>(
    store: Arc<S>,
    config: &AppConfig,
    server: &str,
    mut shutdown: broadcast::Receiver<()>,
) -> Result<()> {
    let mirror = ConfigMirror::new(store, &config.keys.config_root, server)?;
    let mut updates = Box::pin(mirror.sync());

    loop {
        tokio::select! {
            update = updates.next() => match update {
                Some(Ok(settings)) => {
                    if settings.is_empty() {
                        info!(server, "No config variables set");
                    }
                    for (variable, value) in settings.iter() {
                        tracing::trace!(server, variable, value, "Config variable");
                    }
                    println!("{}", settings);
                }
                Some(Err(e)) => return Err(e).context("Config mirror stopped"),
                None => bail!("Config mirror ended unexpectedly"),
            },
            Ok(()) = shutdown.recv() => {
                info!(server, "🛑 Config mirror shutting down");
                return Ok(());
            }
        }
    }
}

/// Heartbeat a server's liveness token
pub async fn heartbeat<S: KeyStore>(
    store: Arc<S>,
    config: &AppConfig,
    server: &str,
    shutdown: broadcast::Receiver<()>,
) -> Result<()> {
    let settings = &config.heartbeat;
    let manager = HeartbeatManager::new(
        store,
        &config.keys.running_root,
        server,
        HeartbeatConfig {
            period: settings.period(),
            beats: settings.count,
            lease: settings.lease()?,
        },
    )?;
    info!(key = manager.key(), token = manager.token(), "Heartbeat token minted");

    let report = manager
        .run(shutdown)
        .await
        .with_context(|| format!("Heartbeat for {} stopped", server))?;

    info!(
        server,
        beats = report.beats,
        released = report.released,
        "👋 Heartbeat finished"
    );
    Ok(())
}

/// Watch the liveness namespace and report fleet events, until Ctrl+C
pub async fn watch_fleet<S: KeyStore>(
    store: Arc<S>,
    config: &AppConfig,
    mut shutdown: broadcast::Receiver<()>,
) -> Result<()> {
    let observer = LivenessObserver::new(store, &config.keys.running_root);
    let (servers, index) = observer.roster().await.context("Failed to list running servers")?;
    let mut fleet = Fleet::seed(servers);
    info!(alive = fleet.len(), "Fleet roster loaded");
    if fleet.is_empty() {
        println!("No servers running");
    }
    for server in fleet.servers() {
        println!("{} is running", server);
    }

    let mut events = Box::pin(observer.watch(index));
    loop {
        tokio::select! {
            event = events.next() => match event {
                Some(Ok(event)) => {
                    println!("{} {}", event.key, event.token.as_deref().unwrap_or_default());
                    println!("{}", event);
                    if event.transition == LivenessTransition::Expired {
                        if let Some(seen) = fleet.last_seen(&event.server) {
                            warn!(
                                server = %event.server,
                                silent_secs = event.observed_at - seen,
                                "Server lease expired"
                            );
                        }
                    }
                    if fleet.apply(&event) {
                        info!(alive = fleet.len(), server = %event.server, "Fleet membership changed");
                    }
                }
                Some(Err(e)) => return Err(e).context("Liveness watch stopped"),
                None => bail!("Liveness watch ended unexpectedly"),
            },
            Ok(()) = shutdown.recv() => {
                info!("🛑 Liveness watch shutting down");
                return Ok(());
            }
        }
    }
}

/// Seconds-based CLI value as a duration, rejecting zero
pub fn positive_secs(secs: u64, what: &str) -> Result<Duration> {
    if secs == 0 {
        bail!("{} must be at least one second", what);
    }
    Ok(Duration::from_secs(secs))
}
