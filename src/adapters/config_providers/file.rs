//! File-backed configuration source.
//!
//! Construction fails fast: the path must exist and carry a recognized
//! extension before the gateway ever starts serving. `watch()` installs a
//! filesystem watcher owned by a background task that folds the burst of
//! events a single save produces into one change signal, so consumers can
//! reload once per signal without their own debounce bookkeeping.
use std::{
    ffi::OsStr,
    path::{Path, PathBuf},
    time::Duration,
};

use async_trait::async_trait;
use eyre::{bail, Result};
use notify::{RecursiveMode, Watcher};
use tokio::sync::mpsc;

use crate::{
    config::{
        loader::{load_config, ConfigFormat},
        models::GatewayConfig,
    },
    ports::config_provider::ConfigProvider,
};

const DEFAULT_DEBOUNCE: Duration = Duration::from_millis(500);

/// Configuration provider reading one local file.
#[derive(Debug)]
pub struct FileConfigProvider {
    path: PathBuf,
    debounce: Duration,
}

impl FileConfigProvider {
    /// Validate the path (extension and existence) and build the provider.
    /// No watcher is installed until [`ConfigProvider::watch`] is called.
    pub fn new(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        ConfigFormat::from_path(&path)?;
        if !path.is_file() {
            bail!("config file {} does not exist", path.display());
        }
        Ok(Self {
            path,
            debounce: DEFAULT_DEBOUNCE,
        })
    }

    /// Override the event-coalescing window (mainly for tests).
    pub fn with_debounce(mut self, debounce: Duration) -> Self {
        self.debounce = debounce;
        self
    }
}

/// Whether a filesystem event concerns the watched config file.
fn touches_config(event: &notify::Event, file_name: Option<&OsStr>) -> bool {
    (event.kind.is_modify() || event.kind.is_create() || event.kind.is_remove())
        && event.paths.iter().any(|p| p.file_name() == file_name)
}

#[async_trait]
impl ConfigProvider for FileConfigProvider {
    async fn load_config(&self) -> Result<GatewayConfig> {
        load_config(&self.path)
    }

    fn watch(&self) -> mpsc::Receiver<()> {
        // Raw channel fed by the notify callback, coalesced channel handed
        // to the caller. Errors here degrade to "no change signals" rather
        // than failing the running gateway.
        let (raw_tx, mut raw_rx) = mpsc::channel::<()>(16);
        let (coalesced_tx, coalesced_rx) = mpsc::channel(1);

        let file_name = self.path.file_name().map(OsStr::to_owned);
        let watcher_result = notify::recommended_watcher(
            move |event: Result<notify::Event, notify::Error>| match event {
                Ok(event) => {
                    if touches_config(&event, file_name.as_deref()) {
                        // A full channel already carries a pending signal.
                        let _ = raw_tx.try_send(());
                    }
                }
                Err(e) => tracing::error!("config file watch error: {e:?}"),
            },
        );

        let mut watcher = match watcher_result {
            Ok(watcher) => watcher,
            Err(e) => {
                tracing::error!("failed to create config file watcher: {e}");
                return coalesced_rx;
            }
        };

        // Watch the parent directory: editors replace files on save, which
        // a watch on the file itself would lose track of.
        let watch_dir = self.path.parent().unwrap_or_else(|| Path::new("."));
        if let Err(e) = watcher.watch(watch_dir, RecursiveMode::NonRecursive) {
            tracing::error!("failed to watch {}: {e}", watch_dir.display());
            return coalesced_rx;
        }

        let debounce = self.debounce;
        tokio::spawn(async move {
            // The watcher must outlive the task, not the provider.
            let _watcher = watcher;
            while raw_rx.recv().await.is_some() {
                tokio::time::sleep(debounce).await;
                while raw_rx.try_recv().is_ok() {}
                if coalesced_tx.send(()).await.is_err() {
                    break;
                }
            }
            tracing::debug!("config file watch task finished");
        });

        coalesced_rx
    }
}
