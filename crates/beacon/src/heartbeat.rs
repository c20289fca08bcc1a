//! Heartbeat Manager
//!
//! Owns one liveness token under `/running/<server>`:
//! 1. Register: create-only write of a fresh UUID with the full lease
//! 2. Beat: every period, compare-and-swap the token onto itself, resetting
//!    the lease
//! 3. Release: compare-and-delete once the beat budget is spent or on
//!    shutdown
//!
//! Registration counts as the first beat.

use beacon_common::error::Result;
use beacon_common::{BeaconError, StoreError, is_valid_segment};
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;
use tokio::sync::{broadcast, watch};

use crate::store::{DeleteOptions, KeyStore, PrevExist, SetOptions, retry_transient};

/// Heartbeat schedule
#[derive(Clone, Debug)]
pub struct HeartbeatConfig {
    /// Time between beats
    pub period: Duration,
    /// Total beats including registration (0 = until stopped)
    pub beats: u64,
    /// Token lease, reset on every beat
    pub lease: Duration,
}

/// How a heartbeat session ended
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HeartbeatReport {
    /// Beats sent, registration included
    pub beats: u64,
    /// Did our conditional delete remove the token?
    pub released: bool,
}

/// Heartbeat Manager for a single server
pub struct HeartbeatManager<S: KeyStore> {
    store: Arc<S>,
    server: String,
    key: String,
    token: String,
    config: HeartbeatConfig,
    progress: watch::Sender<u64>,
}

impl<S: KeyStore> HeartbeatManager<S> {
    /// Create a manager with a fresh token
    pub fn new(
        store: Arc<S>,
        running_root: &str,
        server: &str,
        config: HeartbeatConfig,
    ) -> Result<Self> {
        if !is_valid_segment(server) {
            return Err(BeaconError::Config(format!("invalid server name {:?}", server)));
        }
        if config.period.is_zero() {
            return Err(BeaconError::Config("heartbeat period must be positive".into()));
        }
        if config.lease <= config.period {
            tracing::warn!(
                lease = ?config.lease,
                period = ?config.period,
                "Lease does not outlive the beat period; token may expire between beats"
            );
        }

        let (progress, _) = watch::channel(0);

        Ok(Self {
            store,
            server: server.to_string(),
            key: format!("{}/{}", running_root.trim_end_matches('/'), server),
            token: uuid::Uuid::new_v4().to_string(),
            config,
            progress,
        })
    }

    /// This session's token
    pub fn token(&self) -> &str {
        &self.token
    }

    /// Key holding the token
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Beat counter updates
    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.progress.subscribe()
    }

    fn lease_options(&self, prev_exist: PrevExist, prev_value: Option<String>) -> SetOptions {
        SetOptions {
            prev_exist,
            prev_value,
            ttl: Some(self.config.lease),
        }
    }

    /// Claim the liveness slot
    pub async fn register(&self) -> Result<()> {
        let opts = self.lease_options(PrevExist::Absent, None);
        let (store, key, token, opts) = (&*self.store, self.key.as_str(), self.token.as_str(), &opts);

        match retry_transient("register", move || store.set(key, token, opts)).await {
            Ok(_) => {}
            // A create whose reply was lost leaves our own token behind
            Err(StoreError::NodeExists { .. }) => {
                if !self.holds_token().await? {
                    return Err(BeaconError::AlreadyRegistered {
                        server: self.server.clone(),
                    });
                }
                tracing::debug!(server = %self.server, "Create reply lost, slot already holds our token");
            }
            Err(e) => return Err(e.into()),
        }

        tracing::info!(server = %self.server, key = %self.key, "Registered heartbeat");
        Ok(())
    }

    /// Does the slot currently hold this session's token?
    async fn holds_token(&self) -> Result<bool> {
        let (store, key) = (&*self.store, self.key.as_str());
        match retry_transient("verify", move || store.get(key, false)).await {
            Ok(event) => Ok(event.node.value.as_deref() == Some(self.token.as_str())),
            Err(StoreError::KeyNotFound { .. }) => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    /// Refresh the lease, proving we still own the slot
    pub async fn renew(&self) -> Result<()> {
        let opts = self.lease_options(PrevExist::Exists, Some(self.token.clone()));
        let (store, key, token, opts) = (&*self.store, self.key.as_str(), self.token.as_str(), &opts);

        match retry_transient("renew", move || store.set(key, token, opts)).await {
            Ok(_) => Ok(()),
            Err(StoreError::PreconditionFailed { .. } | StoreError::KeyNotFound { .. }) => {
                Err(BeaconError::TokenSuperseded {
                    server: self.server.clone(),
                })
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Delete the token if it is still ours.
    ///
    /// Returns false when the slot had already lapsed or been taken.
    pub async fn release(&self) -> Result<bool> {
        let opts = DeleteOptions {
            prev_value: Some(self.token.clone()),
            recursive: false,
        };
        let attempts = AtomicU32::new(0);
        let (store, key, opts, counter) = (&*self.store, self.key.as_str(), &opts, &attempts);

        let result = retry_transient("release", move || {
            counter.fetch_add(1, Ordering::Relaxed);
            store.delete(key, opts)
        })
        .await;

        match result {
            Ok(_) => {
                tracing::info!(server = %self.server, "Released heartbeat token");
                Ok(true)
            }
            // An earlier attempt committed but its reply was lost
            Err(StoreError::KeyNotFound { .. }) if attempts.load(Ordering::Relaxed) > 1 => {
                tracing::info!(server = %self.server, "Released heartbeat token");
                Ok(true)
            }
            Err(e @ (StoreError::PreconditionFailed { .. } | StoreError::KeyNotFound { .. })) => {
                tracing::warn!(server = %self.server, error = %e, "Token was not ours to release");
                Ok(false)
            }
            Err(e) => Err(e.into()),
        }
    }

    fn beat(&self, beats: u64) {
        tracing::info!(server = %self.server, beat = beats, "Badum");
        self.progress.send_replace(beats);
    }

    /// Run the heartbeat until the beat budget is spent, a fatal error
    /// occurs, or `shutdown` fires
    pub async fn run(self, mut shutdown: broadcast::Receiver<()>) -> Result<HeartbeatReport> {
        self.register().await?;
        let mut beats = 1;
        self.beat(beats);

        tracing::info!(
            server = %self.server,
            period = ?self.config.period,
            lease = ?self.config.lease,
            beats = self.config.beats,
            "💓 Heartbeat started"
        );

        while self.config.beats == 0 || beats < self.config.beats {
            tokio::select! {
                _ = tokio::time::sleep(self.config.period) => {
                    self.renew().await?;
                    beats += 1;
                    self.beat(beats);
                }
                Ok(()) = shutdown.recv() => {
                    tracing::info!(server = %self.server, "💓 Heartbeat shutting down");
                    break;
                }
            }
        }

        let released = self.release().await?;
        Ok(HeartbeatReport { beats, released })
    }
}
