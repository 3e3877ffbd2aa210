//! Layered runtime configuration: defaults < config file < environment <
//! CLI flags, in the style of `engine/options`'s precedence chain. Unlike
//! that crate's dynamic, many-source option registry, this is just the
//! handful of settings `wess` itself needs.

use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::error::Error;

#[derive(Debug, Clone)]
pub struct Config {
    pub host: IpAddr,
    pub announce_port: u16,
    pub task_port: u16,
    pub workers: usize,
    pub blocksize: usize,
    pub archive_path: PathBuf,
    pub pcoord_ndim: usize,
    pub pcoord_len: usize,
    pub n_bins: usize,
    pub check_interval: Duration,
    pub announce_interval: Duration,
    pub abort_interval: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            host: "127.0.0.1".parse().unwrap(),
            announce_port: 5555,
            task_port: 5556,
            workers: std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1),
            blocksize: 16,
            archive_path: PathBuf::from("wess.archive"),
            pcoord_ndim: 1,
            pcoord_len: 1,
            n_bins: 1,
            check_interval: Duration::from_millis(100),
            announce_interval: Duration::from_secs(1),
            abort_interval: Duration::from_secs(120),
        }
    }
}

/// The config-file shape: every field optional, so a partial file only
/// overrides what it names and leaves the rest at their defaults.
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawConfig {
    host: Option<IpAddr>,
    announce_port: Option<u16>,
    task_port: Option<u16>,
    workers: Option<usize>,
    blocksize: Option<usize>,
    archive_path: Option<PathBuf>,
    pcoord_ndim: Option<usize>,
    pcoord_len: Option<usize>,
    n_bins: Option<usize>,
    check_interval_ms: Option<u64>,
    announce_interval_ms: Option<u64>,
    abort_interval_s: Option<u64>,
}

impl RawConfig {
    fn merge_into(self, config: &mut Config) {
        if let Some(v) = self.host {
            config.host = v;
        }
        if let Some(v) = self.announce_port {
            config.announce_port = v;
        }
        if let Some(v) = self.task_port {
            config.task_port = v;
        }
        if let Some(v) = self.workers {
            config.workers = v;
        }
        if let Some(v) = self.blocksize {
            config.blocksize = v;
        }
        if let Some(v) = self.archive_path {
            config.archive_path = v;
        }
        if let Some(v) = self.pcoord_ndim {
            config.pcoord_ndim = v;
        }
        if let Some(v) = self.pcoord_len {
            config.pcoord_len = v;
        }
        if let Some(v) = self.n_bins {
            config.n_bins = v;
        }
        if let Some(v) = self.check_interval_ms {
            config.check_interval = Duration::from_millis(v);
        }
        if let Some(v) = self.announce_interval_ms {
            config.announce_interval = Duration::from_millis(v);
        }
        if let Some(v) = self.abort_interval_s {
            config.abort_interval = Duration::from_secs(v);
        }
    }
}

fn env_override(config: &mut Config) -> Result<(), Error> {
    if let Ok(v) = std::env::var("WESS_HOST") {
        config.host = v
            .parse()
            .map_err(|e| Error::Config(format!("WESS_HOST: {e}")))?;
    }
    if let Ok(v) = std::env::var("WESS_ANNOUNCE_PORT") {
        config.announce_port = v
            .parse()
            .map_err(|e| Error::Config(format!("WESS_ANNOUNCE_PORT: {e}")))?;
    }
    if let Ok(v) = std::env::var("WESS_TASK_PORT") {
        config.task_port = v
            .parse()
            .map_err(|e| Error::Config(format!("WESS_TASK_PORT: {e}")))?;
    }
    if let Ok(v) = std::env::var("WESS_WORKERS") {
        config.workers = v
            .parse()
            .map_err(|e| Error::Config(format!("WESS_WORKERS: {e}")))?;
    }
    if let Ok(v) = std::env::var("WESS_ARCHIVE_PATH") {
        config.archive_path = PathBuf::from(v);
    }
    Ok(())
}

/// Loads `defaults < file (if present) < environment`; CLI flag overrides
/// are applied by the caller afterward, since they're parsed by `clap`
/// before a `Config` exists.
pub fn load(config_file: Option<&Path>) -> Result<Config, Error> {
    let mut config = Config::default();

    if let Some(path) = config_file {
        let text = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("reading {}: {e}", path.display())))?;
        let raw: RawConfig =
            toml::from_str(&text).map_err(|e| Error::Config(format!("parsing {}: {e}", path.display())))?;
        raw.merge_into(&mut config);
    }

    env_override(&mut config)?;
    Ok(config)
}
