// Copyright 2024 dproxy contributors
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License
// along with this program.  If not, see <http://www.gnu.org/licenses/>.

mod config;

use anyhow::{Context, Result};
use clap::Parser;
use config::{Config, PolicyConfig};
use dproxy_core::{cache, dispatcher, Cache, Dispatcher, Policy};
use log::{info, warn, LevelFilter};
use std::{path::PathBuf, sync::Arc};

const DEFAULT_CONFIG: &str = include_str!("../configs/default.toml");

#[derive(Parser)]
#[command(name = "dproxy", about = "Caching, policy-driven DNS forwarding proxy")]
struct Args {
    /// Path to a TOML configuration file. Falls back to a built-in default.
    #[arg(short, long)]
    config: Option<PathBuf>,
}

fn load_config(args: &Args) -> Result<Config> {
    let raw = match &args.config {
        Some(path) => std::fs::read_to_string(path)
            .with_context(|| format!("reading config file {}", path.display()))?,
        None => {
            warn!("no --config given, using the built-in default configuration");
            DEFAULT_CONFIG.to_string()
        }
    };
    toml::from_str(&raw).context("parsing configuration")
}

fn init_logging(level: &str) {
    let level = match level.to_ascii_lowercase().as_str() {
        "off" => LevelFilter::Off,
        "error" => LevelFilter::Error,
        "warn" => LevelFilter::Warn,
        "debug" => LevelFilter::Debug,
        "trace" => LevelFilter::Trace,
        _ => LevelFilter::Info,
    };
    let _ = simple_logger::SimpleLogger::new().with_level(level).init();
}

/// Non-recursively scan `policy.path` plus any explicit `policy.files` and
/// feed every line to the policy engine.
fn load_policy(cfg: &PolicyConfig) -> Policy {
    let policy = Policy::new();

    if let Some(dir) = &cfg.path {
        match std::fs::read_dir(dir) {
            Ok(entries) => {
                for entry in entries.flatten() {
                    let path = entry.path();
                    if !path.is_file() {
                        continue;
                    }
                    match std::fs::read_to_string(&path) {
                        Ok(content) => {
                            info!("loaded policy file {}", path.display());
                            policy.load_str(&content);
                        }
                        Err(e) => warn!("failed to read policy file {}: {e}", path.display()),
                    }
                }
            }
            Err(e) => warn!("failed to scan policy directory {dir}: {e}"),
        }
    }

    for file in &cfg.files {
        match std::fs::read_to_string(file) {
            Ok(content) => {
                info!("loaded policy file {file}");
                policy.load_str(&content);
            }
            Err(e) => warn!("failed to read policy file {file}: {e}"),
        }
    }

    policy
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let cfg = load_config(&args)?;
    init_logging(&cfg.log.level);

    let policy = Arc::new(load_policy(&cfg.policy));

    let (timeout, concurrency, queue_size) = dispatcher::resolve_defaults(
        cfg.dns.timeout,
        cfg.dns.concurrency,
        cfg.dns.queue_size,
    );

    let (cache, sweeper) = if cfg.cache.enable {
        let (cap, ttl, interval) = cache::resolve_defaults(cfg.cache.cap, cfg.cache.ttl, cfg.cache.interval);
        let cache = Cache::new(cap, ttl);
        let sweeper = cache::spawn_sweeper(cache.clone(), interval);
        (Some(cache), Some(sweeper))
    } else {
        (None, None)
    };

    let dispatcher = Dispatcher::new(
        cfg.dns.listen_addr.clone(),
        cfg.dns.upper.clone(),
        timeout,
        concurrency,
        queue_size,
        policy,
        cache,
    )?;

    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("received interrupt, stopping cache sweeper");
            if let Some(sweeper) = sweeper {
                sweeper.close();
            }
        }
    });

    info!("dproxy ready");
    dispatcher.run().await?;
    Ok(())
}
