use crate::browser::BrowserConfig;
use crate::perception::LoopConfig;
use crate::registry::RegistryConfig;
use clap::Parser;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::debug;

/// Drive a browser from plain-language tasks and stream progress over SSE.
#[derive(Debug, Clone, Parser)]
#[command(name = "lookout", version, about)]
pub struct Args {
    #[arg(long, env = "LOOKOUT_HOST", default_value = "127.0.0.1")]
    pub host: String,

    #[arg(long, env = "LOOKOUT_PORT", default_value_t = 5174)]
    pub port: u16,

    /// Show the browser window unless a request asks otherwise.
    #[arg(long)]
    pub headed: bool,

    /// Persist every captured screenshot under this directory.
    #[arg(long, env = "SNAPSHOT_DIR")]
    pub snapshot_dir: Option<PathBuf>,

    /// How long a finished run stays queryable once nobody watches it.
    #[arg(long, env = "RUN_RETENTION_SECS", default_value_t = 300)]
    pub retention_secs: u64,

    /// Look for a Chrome with remote debugging on 9222-9226 before launching one.
    #[arg(long)]
    pub probe_chrome: bool,

    #[arg(long, env = "LOG_DIR", default_value = "logs")]
    pub log_dir: PathBuf,
}

impl Args {
    pub fn browser(&self) -> BrowserConfig {
        BrowserConfig {
            headless: !self.headed,
            discover: self.probe_chrome,
            ..BrowserConfig::default()
        }
    }

    pub fn registry(&self) -> RegistryConfig {
        RegistryConfig { retention: Duration::from_secs(self.retention_secs) }
    }

    pub fn run_loop(&self) -> LoopConfig {
        LoopConfig { headless: !self.headed, ..LoopConfig::default() }
    }

    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Loads `config.env` into the process environment if it exists. Variables
/// already set win over the file.
pub fn load_env_file(path: impl AsRef<Path>) -> bool {
    match dotenvy::from_path(path.as_ref()) {
        Ok(()) => true,
        Err(e) => {
            debug!(path = %path.as_ref().display(), error = %e, "env file not loaded");
            false
        }
    }
}
