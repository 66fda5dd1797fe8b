mod bundle;
pub mod file_rpc;
pub mod mock;
pub mod pinterest;
pub mod transcode;
pub mod twitter;
pub mod ytdlp;

use std::collections::HashMap;
use std::sync::Arc;

use crate::config::Config;
use crate::domain::Kind;
use crate::sync_ext::MutexExt;

use super::adapter::{DownloaderAdapter, PollingAdapter};

/// What drives a given `Kind`: either a spawned line-oriented child process
/// or a polled external daemon (§4.4.1).
#[derive(Clone)]
pub enum Driver {
    Process(Arc<dyn DownloaderAdapter>),
    Polling(Arc<dyn PollingAdapter>),
}

/// Closed `Kind -> adapter` mapping (§4.4 table), replacing hand-written
/// `match` statements scattered through the supervisor with a single
/// registry lookup.
///
/// `overrides` lets test harnesses substitute a [`mock`] driver for a kind
/// without spawning a real `yt-dlp`/`aria2`/etc. process, the way the
/// `MockAdapter` described in the design ledger replaces real `ffmpeg` in
/// this codebase's integration tests.
pub struct AdapterRegistry {
    config: Config,
    overrides: std::sync::Mutex<HashMap<Kind, Driver>>,
}

impl AdapterRegistry {
    pub fn new(config: Config) -> Self {
        Self {
            config,
            overrides: std::sync::Mutex::new(HashMap::new()),
        }
    }

    /// Test-only hook: force `kind` to resolve to `driver` regardless of
    /// the built-in mapping below.
    pub fn override_driver(&self, kind: Kind, driver: Driver) {
        self.overrides.lock_unpoisoned().insert(kind, driver);
    }

    pub fn driver_for(&self, kind: Kind) -> Driver {
        if let Some(driver) = self.overrides.lock_unpoisoned().get(&kind) {
            return driver.clone();
        }
        match kind {
            Kind::Youtube => Driver::Process(Arc::new(ytdlp::YtdlpAdapter::youtube(&self.config))),
            Kind::Hls => Driver::Process(Arc::new(ytdlp::YtdlpAdapter::hls(&self.config))),
            Kind::Twitter => Driver::Process(Arc::new(twitter::TwitterAdapter::new(&self.config))),
            Kind::Pinterest => Driver::Process(Arc::new(pinterest::PinterestAdapter::new(&self.config))),
            Kind::File => Driver::Polling(Arc::new(file_rpc::FileRpcAdapter::new(&self.config))),
            Kind::Auto => unreachable!("Kind::Auto must be resolved before reaching the supervisor"),
        }
    }

    pub fn transcode_adapter(&self, input_path: std::path::PathBuf) -> transcode::TranscodeAdapter {
        transcode::TranscodeAdapter::new(input_path, &self.config)
    }
}
