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

//! The policy engine: rule parsing, per-domain action storage and
//! response side-effect execution (ipset insertion, script invocation).

use log::{debug, warn};
use parking_lot::RwLock;
use std::net::IpAddr;
use tokio::process::Command;
use trust_dns_proto::{op::Message, rr::RData};
use wildmatch::Trie;

/// The up-to-four independent optional actions a domain's policy can carry.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PolicyRecord {
    pub upstream_override: Option<String>,
    pub ipset_names: Option<Vec<String>>,
    pub script_path: Option<String>,
    pub synth_address: Option<IpAddr>,
}

/// Stores per-domain [`PolicyRecord`]s in a wildcard suffix trie and runs
/// their side effects against resolved answers.
pub struct Policy {
    trie: RwLock<Trie<PolicyRecord>>,
}

impl Default for Policy {
    fn default() -> Self {
        Self::new()
    }
}

impl Policy {
    pub fn new() -> Self {
        Self {
            trie: RwLock::new(Trie::new()),
        }
    }

    /// Parse and apply every line of `content` (e.g. a whole policy file).
    pub fn load_str(&self, content: &str) {
        for line in content.lines() {
            self.load_line(line);
        }
    }

    /// Parse and apply a single rule line. Malformed lines, comments and
    /// blank lines are ignored; unknown plugin tags are ignored with a
    /// warning.
    pub fn load_line(&self, line: &str) {
        let line = line.trim_start_matches(' ');
        if line.is_empty() || line.starts_with('#') {
            return;
        }

        let parts: Vec<&str> = line.split('/').collect();
        if parts.len() < 3 {
            warn!("ignoring malformed policy line: {line}");
            return;
        }

        let plugin = parts[0];
        let domain = parts[1];
        let value = parts[2..].join("/");
        let wildcard_key = format!("*.{domain}");

        match plugin {
            "server=" => {
                let mut record = self.existing_record(&wildcard_key);
                record.upstream_override = Some(value.replace('#', ":"));
                self.trie.write().insert(&wildcard_key, record);
            }
            "ipset=" => {
                let mut record = self.existing_record(&wildcard_key);
                record.ipset_names = Some(value.split(',').map(str::to_owned).collect());
                self.trie.write().insert(&wildcard_key, record);
            }
            "script=" => {
                let mut record = self.existing_record(&wildcard_key);
                record.script_path = Some(value);
                self.trie.write().insert(&wildcard_key, record);
            }
            "address=" => match value.parse::<IpAddr>() {
                Ok(addr) => {
                    // address= is authoritative for the domain: it replaces
                    // the whole record rather than merging into it.
                    let record = PolicyRecord {
                        synth_address: Some(addr),
                        ..Default::default()
                    };
                    self.trie.write().insert(&wildcard_key, record);
                }
                Err(_) => warn!("ignoring address= rule with invalid IP literal: {line}"),
            },
            other => warn!("ignoring policy line with unknown plugin tag {other:?}: {line}"),
        }
    }

    /// Fetch the record currently stored at the exact wildcard key, used
    /// to merge a new field into a rule loaded earlier for the same
    /// domain. `wildcard_key` is an exact trie path (the same string used
    /// on insert), so this reuses `find` without wildcard fallback ever
    /// triggering.
    fn existing_record(&self, wildcard_key: &str) -> PolicyRecord {
        self.trie
            .read()
            .find(wildcard_key)
            .cloned()
            .unwrap_or_default()
    }

    /// Look up the policy rule for a normalized domain, if any.
    pub fn find(&self, domain: &str) -> Option<PolicyRecord> {
        let query = format!(".{domain}");
        self.trie.read().find(&query).cloned()
    }

    /// `[server]` if the domain has an upstream override, else empty.
    pub fn upstream_override(&self, domain: &str) -> Vec<String> {
        self.find(domain)
            .and_then(|r| r.upstream_override)
            .into_iter()
            .collect()
    }

    /// `[addr]` if the domain has a synthesised address, else empty.
    pub fn synth_address(&self, domain: &str) -> Vec<IpAddr> {
        self.find(domain)
            .and_then(|r| r.synth_address)
            .into_iter()
            .collect()
    }

    /// Run the domain's configured side effects (ipset insertion, script
    /// invocation) against every A/AAAA address in `response`'s answer
    /// section. Best-effort: failures are logged and swallowed.
    pub async fn apply_side_effects(&self, domain: &str, response: &Message) {
        let record = match self.find(domain) {
            Some(r) => r,
            None => return,
        };

        let ips = answer_ips(response);
        if ips.is_empty() {
            return;
        }

        if let Some(sets) = &record.ipset_names {
            for set in sets {
                for ip in &ips {
                    run_ipset(set, ip).await;
                }
            }
        }

        if let Some(script) = &record.script_path {
            for ip in &ips {
                run_script(script, ip).await;
            }
        }
    }
}

/// Extract every A/AAAA address carried in a message's Answer section.
pub fn answer_ips(msg: &Message) -> Vec<IpAddr> {
    msg.answers()
        .iter()
        .filter_map(|rec| match rec.data() {
            Some(RData::A(a)) => Some(IpAddr::V4(a.0)),
            Some(RData::AAAA(aaaa)) => Some(IpAddr::V6(aaaa.0)),
            _ => None,
        })
        .collect()
}

async fn run_ipset(set: &str, ip: &IpAddr) {
    match Command::new("ipset")
        .arg("add")
        .arg(set)
        .arg(ip.to_string())
        .output()
        .await
    {
        Ok(out) if !out.status.success() => {
            debug!("ipset add {set} {ip} exited non-zero, ignoring");
        }
        Err(e) => debug!("failed to invoke ipset: {e}"),
        _ => {}
    }
}

async fn run_script(script: &str, ip: &IpAddr) {
    let invocation = format!("{script} {ip}");
    match Command::new("/bin/bash")
        .arg("-c")
        .arg(&invocation)
        .output()
        .await
    {
        Ok(out) if !out.status.success() => {
            debug!("script {script} {ip} exited non-zero, ignoring");
        }
        Err(e) => debug!("failed to invoke script {script}: {e}"),
        _ => {}
    }
}
