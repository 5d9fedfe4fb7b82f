use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use anyhow::Context;
use inventory_core::InventoryClient;
use uuid::Uuid;

use crate::sync::fetch::{
    DEFAULT_BATCH_SIZE, DEFAULT_MAX_ATTEMPTS, DEFAULT_MAX_BACKGROUND_OUTSTANDING,
    DEFAULT_MAX_OUTSTANDING, FetchConfig,
};
use crate::sync::observer::{Alert, Notification};
use crate::sync::session::{InventorySession, SessionConfig};
use crate::sync::snapshot::SnapshotCache;
use crate::sync::store::InventoryStore;

const DEFAULT_CACHE_DIR_NAME: &str = "inventory-mirror";
const DEFAULT_TICK_MS: u64 = 100;

#[derive(Clone, Debug)]
pub struct DaemonConfig {
    pub caps_url: String,
    pub ais_url: String,
    pub token: String,
    pub agent_id: Uuid,
    pub root_id: Uuid,
    pub library_root_id: Option<Uuid>,
    pub library_owner_id: Uuid,
    pub cache_root: PathBuf,
    pub tick_interval: Duration,
    pub fetch: FetchConfig,
}

impl DaemonConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        let home = dirs::home_dir().context("home directory is unavailable")?;
        Self::from_vars(|name| std::env::var(name).ok(), &home)
    }

    pub fn from_vars<F>(var: F, home: &Path) -> anyhow::Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let cache_root = var("INVENTORY_CACHE_DIR")
            .map(|value| expand_with_home(&value, home))
            .unwrap_or_else(default_cache_root);
        let fetch = FetchConfig {
            batch_size: read_number(var("INVENTORY_FETCH_BATCH"), DEFAULT_BATCH_SIZE),
            max_outstanding: read_number(var("INVENTORY_MAX_OUTSTANDING"), DEFAULT_MAX_OUTSTANDING),
            max_background_outstanding: read_number(
                var("INVENTORY_MAX_BACKGROUND"),
                DEFAULT_MAX_BACKGROUND_OUTSTANDING,
            ),
            max_attempts: read_number(var("INVENTORY_FETCH_ATTEMPTS"), DEFAULT_MAX_ATTEMPTS),
            legacy_mode: read_bool(var("INVENTORY_LEGACY_FETCH"), false),
            ..FetchConfig::default()
        };

        Ok(Self {
            caps_url: required_var(&var, "INVENTORY_CAPS_URL")?,
            ais_url: required_var(&var, "INVENTORY_AIS_URL")?,
            token: required_var(&var, "INVENTORY_TOKEN")?,
            agent_id: required_uuid(&var, "INVENTORY_AGENT_ID")?,
            root_id: required_uuid(&var, "INVENTORY_ROOT_ID")?,
            library_root_id: optional_uuid(&var, "INVENTORY_LIBRARY_ROOT_ID")?,
            library_owner_id: optional_uuid(&var, "INVENTORY_LIBRARY_OWNER_ID")?.unwrap_or_default(),
            cache_root,
            tick_interval: Duration::from_millis(read_number(var("INVENTORY_TICK_MS"), DEFAULT_TICK_MS)),
            fetch,
        })
    }

    fn session_config(&self) -> SessionConfig {
        SessionConfig {
            agent_id: self.agent_id,
            primary_root: self.root_id,
            library_root: self.library_root_id,
            library_owner_id: self.library_owner_id,
            fetch: self.fetch.clone(),
        }
    }
}

pub struct DaemonRuntime {
    config: DaemonConfig,
    session: InventorySession,
}

impl DaemonRuntime {
    pub async fn bootstrap(config: DaemonConfig) -> anyhow::Result<Self> {
        tokio::fs::create_dir_all(&config.cache_root)
            .await
            .with_context(|| format!("failed to create cache root at {:?}", config.cache_root))?;

        let client = InventoryClient::new(&config.caps_url, &config.ais_url, config.token.clone())
            .context("invalid inventory service urls")?;
        let session = InventorySession::new(
            client,
            SnapshotCache::new(&config.cache_root),
            config.session_config(),
        )
        .context("failed to initialize inventory session")?;

        Ok(Self { config, session })
    }

    pub async fn run(self) -> anyhow::Result<()> {
        self.run_until(tokio::signal::ctrl_c()).await
    }

    /// Drives the session until `shutdown` resolves, then logs out.
    pub async fn run_until<F>(mut self, shutdown: F) -> anyhow::Result<()>
    where
        F: Future<Output = std::io::Result<()>>,
    {
        tracing::info!(
            agent = %self.config.agent_id,
            root = %self.config.root_id,
            cache_root = %self.config.cache_root.display(),
            legacy_fetch = self.config.fetch.legacy_mode,
            "started"
        );

        match self.session.load_cache() {
            Ok(0) => {}
            Ok(restored) => tracing::info!(objects = restored, "restored inventory snapshot"),
            Err(err) => tracing::warn!(error = %err, "failed to load inventory snapshot"),
        }
        self.session.subscribe(Box::new(log_notification));
        self.session.request_everything();

        let mut ticker = tokio::time::interval(self.config.tick_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let mut saved = false;
        tokio::pin!(shutdown);
        loop {
            tokio::select! {
                res = &mut shutdown => {
                    res.context("failed waiting for shutdown signal")?;
                    break;
                }
                _ = ticker.tick() => {
                    self.session.tick();
                    if self.session.everything_fetched() && !saved {
                        saved = true;
                        match self.session.save_cache() {
                            Ok(written) => tracing::info!(objects = written, "inventory snapshot saved"),
                            Err(err) => tracing::warn!(error = %err, "failed to save inventory snapshot"),
                        }
                    }
                }
            }
        }

        tracing::info!("shutting down");
        self.session.logout();
        Ok(())
    }
}

/// Removes the snapshots this configuration would load. Returns how many existed.
pub fn clear_cache(config: &DaemonConfig) -> anyhow::Result<usize> {
    let cache = SnapshotCache::new(&config.cache_root);
    let mut roots = vec![(config.root_id, config.agent_id)];
    if let Some(library) = config.library_root_id {
        roots.push((library, config.library_owner_id));
    }
    let mut removed = 0;
    for (root, owner) in roots {
        if cache
            .clear(root, owner)
            .with_context(|| format!("failed to remove snapshot of {root} for {owner}"))?
        {
            removed += 1;
        }
    }
    Ok(removed)
}

include!("daemon_helpers.rs");

#[cfg(test)]
#[path = "daemon_tests.rs"]
mod tests;
