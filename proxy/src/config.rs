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

//! The TOML configuration document. Parsing and policy-file discovery are
//! ambient collaborators, not part of the core query pipeline.

use serde::Deserialize;

fn default_listen_addr() -> String {
    dproxy_core::dispatcher::DEFAULT_LISTEN_ADDR.to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

#[derive(Debug, Deserialize)]
pub struct Config {
    pub dns: DnsConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub policy: PolicyConfig,
    #[serde(default)]
    pub log: LogConfig,
}

#[derive(Debug, Deserialize)]
pub struct DnsConfig {
    pub upper: Vec<String>,
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,
    #[serde(default)]
    pub timeout: i64,
    #[serde(default)]
    pub concurrency: i64,
    #[serde(default)]
    pub queue_size: i64,
}

#[derive(Debug, Default, Deserialize)]
pub struct CacheConfig {
    #[serde(default)]
    pub enable: bool,
    #[serde(default)]
    pub cap: i64,
    #[serde(default)]
    pub ttl: i64,
    #[serde(default)]
    pub interval: i64,
}

#[derive(Debug, Default, Deserialize)]
pub struct PolicyConfig {
    pub path: Option<String>,
    #[serde(default)]
    pub files: Vec<String>,
}

#[derive(Debug, Deserialize)]
pub struct LogConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builtin_default_config_parses() {
        let cfg: Config = toml::from_str(include_str!("../configs/default.toml")).unwrap();
        assert!(!cfg.dns.upper.is_empty());
        assert!(cfg.cache.enable);
    }

    #[test]
    fn minimal_config_fills_in_defaults() {
        let cfg: Config = toml::from_str(
            r#"
            [dns]
            upper = ["8.8.8.8:53"]
            "#,
        )
        .unwrap();
        assert_eq!(cfg.dns.listen_addr, ":53");
        assert_eq!(cfg.log.level, "info");
        assert!(!cfg.cache.enable);
    }
}
