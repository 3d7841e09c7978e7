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

//! Universal error type for `dproxy-core`, following the teacher's
//! `thiserror`-based library error convention.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, CoreError>;

/// Errors the core query pipeline can surface. Only [`CoreError::Config`]
/// and [`CoreError::Bind`] are fatal to the process; the rest are logged
/// and the affected query is dropped or falls through to the next path.
#[derive(Error, Debug)]
pub enum CoreError {
    /// `dns.upper` was empty or otherwise invalid at startup.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// The listen address could not be resolved or bound.
    #[error("failed to bind listener: {0}")]
    Bind(#[source] std::io::Error),

    /// A per-query transient failure: malformed request, empty questions,
    /// failed pack, or failed send to the client.
    #[error("query handling failed: {0}")]
    Query(String),

    /// A per-upstream transient failure: dial, write, read or parse error
    /// against a single upstream resolver.
    #[error("upstream {upstream} failed: {source}")]
    Upstream {
        upstream: String,
        #[source]
        source: std::io::Error,
    },

    /// The upstream returned bytes that do not parse as a DNS message.
    #[error("upstream {upstream} returned an unparsable response: {source}")]
    UpstreamParse {
        upstream: String,
        #[source]
        source: trust_dns_proto::error::ProtoError,
    },
}
