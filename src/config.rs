//! Server configuration
//!
//! Every flag falls back to an environment variable, which in turn may come
//! from a `.env` file loaded at start-up.

use anyhow::{bail, Result};
use clap::{ArgAction, Parser};
use std::path::PathBuf;

use crate::download::VERSION_PLACEHOLDER;

pub const DEFAULT_RELEASE_URL: &str =
    "https://github.com/bpftrace/bpftrace/releases/{version}/download/bpftrace";

#[derive(Parser, Debug, Clone)]
#[command(author, version, about = "bpftrace Playground - run scripts over a websocket")]
pub struct Config {
    /// Port to listen on
    #[arg(long, env = "PORT", default_value_t = 8088)]
    pub port: u16,

    /// Cache directory for downloaded binaries
    #[arg(long, env = "CACHE_DIR", default_value = "/tmp/cache")]
    pub cache_dir: PathBuf,

    /// Maximum cache entries
    #[arg(long = "max-cache", env = "MAX_CACHE", default_value_t = 5)]
    pub max_cache: usize,

    /// Maximum timeout in milliseconds
    #[arg(long = "max-timeout", env = "MAX_TIMEOUT", default_value_t = 30_000)]
    pub max_timeout_ms: u64,

    /// Executions allowed to run at the same time
    #[arg(long, env = "MAX_CONCURRENT", default_value_t = 1)]
    pub max_concurrent: usize,

    /// Release download URL, `{version}` is replaced with the requested version
    #[arg(long, env = "RELEASE_URL", default_value = DEFAULT_RELEASE_URL)]
    pub release_url: String,

    /// Run each execution in a fresh network namespace
    #[arg(long, env = "NETWORK_ISOLATION", default_value_t = true, action = ArgAction::Set)]
    pub network_isolation: bool,
}

impl Config {
    pub fn validate(&self) -> Result<()> {
        if self.max_cache == 0 {
            bail!("--max-cache must be at least 1");
        }
        if self.max_concurrent == 0 {
            bail!("--max-concurrent must be at least 1");
        }
        if !self.release_url.contains(VERSION_PLACEHOLDER) {
            bail!(
                "--release-url must contain {} (got {})",
                VERSION_PLACEHOLDER,
                self.release_url
            );
        }
        Ok(())
    }
}
