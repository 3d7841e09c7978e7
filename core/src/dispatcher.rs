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

//! The UDP listener, bounded worker pool and per-query decision pipeline.

use crate::{cache::Cache, dns, error::CoreError, policy::Policy, upstream};
use log::{info, warn};
use std::{net::SocketAddr, sync::Arc, time::Duration};
use tokio::{
    net::UdpSocket,
    sync::{mpsc, Mutex as AsyncMutex},
    time,
};
use trust_dns_proto::op::Message;

pub const DEFAULT_LISTEN_ADDR: &str = ":53";
pub const DEFAULT_TIMEOUT_SECS: u64 = 5;
pub const DEFAULT_CONCURRENCY: usize = 10;

/// Apply the "non-positive means default" rule for dispatcher knobs.
pub fn resolve_defaults(
    timeout_secs: i64,
    concurrency: i64,
    queue_size: i64,
) -> (Duration, usize, usize) {
    let timeout = if timeout_secs > 0 {
        Duration::from_secs(timeout_secs as u64)
    } else {
        Duration::from_secs(DEFAULT_TIMEOUT_SECS)
    };
    let concurrency = if concurrency > 0 {
        concurrency as usize
    } else {
        DEFAULT_CONCURRENCY
    };
    let queue_size = if queue_size > 0 {
        queue_size as usize
    } else {
        concurrency * 5
    };
    (timeout, concurrency, queue_size)
}

/// `:PORT`-style addresses (as accepted by the original Go `net` package)
/// have no host component; bind them against the unspecified IPv4 address.
fn normalize_listen_addr(addr: &str) -> String {
    match addr.strip_prefix(':') {
        Some(port) => format!("0.0.0.0:{port}"),
        None => addr.to_string(),
    }
}

struct ClientContext {
    socket: Arc<UdpSocket>,
    src: SocketAddr,
    buf: Vec<u8>,
}

pub struct Dispatcher {
    listen_addr: String,
    upstreams: Vec<String>,
    timeout: Duration,
    concurrency: usize,
    queue_size: usize,
    policy: Arc<Policy>,
    cache: Option<Arc<Cache<Message>>>,
}

impl Dispatcher {
    pub fn new(
        listen_addr: impl Into<String>,
        upstreams: Vec<String>,
        timeout: Duration,
        concurrency: usize,
        queue_size: usize,
        policy: Arc<Policy>,
        cache: Option<Arc<Cache<Message>>>,
    ) -> Result<Arc<Self>, CoreError> {
        if upstreams.is_empty() {
            return Err(CoreError::Config("dns.upper must not be empty".into()));
        }
        Ok(Arc::new(Self {
            listen_addr: listen_addr.into(),
            upstreams,
            timeout,
            concurrency,
            queue_size,
            policy,
            cache,
        }))
    }

    /// Resolve and bind the listen address. Split out from [`Self::serve`]
    /// so tests can discover the actual ephemeral port before traffic
    /// starts flowing.
    pub async fn bind(&self) -> Result<Arc<UdpSocket>, CoreError> {
        UdpSocket::bind(normalize_listen_addr(&self.listen_addr))
            .await
            .map(Arc::new)
            .map_err(CoreError::Bind)
    }

    /// Bind the listener, spawn the worker pool, and read datagrams until
    /// an unrecoverable I/O error occurs. The listener is a single
    /// producer; workers are multiple consumers sharing a bounded queue,
    /// so a full queue blocks the listener (backpressure).
    pub async fn run(self: Arc<Self>) -> Result<(), CoreError> {
        let socket = self.bind().await?;
        info!("dproxy listening on {}", self.listen_addr);
        self.serve(socket).await
    }

    /// Spawn the worker pool and read datagrams from an already-bound
    /// socket until an unrecoverable I/O error occurs.
    pub async fn serve(self: Arc<Self>, socket: Arc<UdpSocket>) -> Result<(), CoreError> {
        let (tx, rx) = mpsc::channel::<ClientContext>(self.queue_size);
        let rx = Arc::new(AsyncMutex::new(rx));

        for worker_id in 0..self.concurrency {
            let dispatcher = self.clone();
            let rx = rx.clone();
            tokio::spawn(async move {
                loop {
                    let ctx = {
                        let mut rx = rx.lock().await;
                        rx.recv().await
                    };
                    match ctx {
                        Some(ctx) => dispatcher.handle_query(ctx).await,
                        None => {
                            info!("worker {worker_id} exiting: queue closed");
                            return;
                        }
                    }
                }
            });
        }

        loop {
            let mut buf = vec![0u8; 512];
            let (n, src) = socket.recv_from(&mut buf).await.map_err(CoreError::Bind)?;
            buf.truncate(n);
            if tx
                .send(ClientContext {
                    socket: socket.clone(),
                    src,
                    buf,
                })
                .await
                .is_err()
            {
                // All workers have exited; nothing left to serve.
                return Ok(());
            }
        }
    }

    async fn handle_query(&self, ctx: ClientContext) {
        let ClientContext { socket, src, buf } = ctx;

        let request = match Message::from_vec(&buf) {
            Ok(m) => m,
            Err(e) => {
                warn!("dropping malformed request from {src}: {e}");
                return;
            }
        };
        if request.queries().is_empty() {
            warn!("dropping request with no questions from {src}");
            return;
        }
        let domain = match dns::first_question_domain(&request) {
            Some(d) => d,
            None => return,
        };

        // (a) address rule short-circuit
        let synth = self.policy.synth_address(&domain);
        if !synth.is_empty() {
            let resp = dns::synthesize_response(&request, &synth);
            if self.send(&socket, src, &domain, &resp).await.is_ok() {
                return;
            }
        }

        // (b) cache path
        if let Some(cache) = &self.cache {
            if dns::all_questions_are_a_or_aaaa(&request) {
                if let Some(cached) = cache.get(&domain) {
                    if let Some(resp) = dns::build_cache_response(&request, &cached) {
                        if self.send(&socket, src, &domain, &resp).await.is_ok() {
                            return;
                        }
                    }
                }
            }
        }

        // (c) upstream path
        let upstreams = {
            let overridden = self.policy.upstream_override(&domain);
            if overridden.is_empty() {
                self.upstreams.clone()
            } else {
                overridden
            }
        };

        let wire = match request.to_vec() {
            Ok(w) => w,
            Err(e) => {
                warn!("failed to pack request for {domain}: {e}");
                return;
            }
        };

        for up in &upstreams {
            let resp = match upstream::resolve(up, &wire, self.timeout).await {
                Ok(resp) => resp,
                Err(e) => {
                    warn!("upstream {up} failed for {domain}: {e}");
                    continue;
                }
            };

            if self.send(&socket, src, &domain, &resp).await.is_ok() {
                if let Some(cache) = &self.cache {
                    if dns::answers_are_all_a_or_aaaa(&resp) {
                        cache.set(domain.clone(), resp);
                    }
                }
                return;
            }
        }

        warn!("all upstreams failed for {domain}, dropping query from {src}");
    }

    /// Run policy side effects, then pack and write the response to the
    /// client. Side effects always run before the client sees a reply.
    async fn send(
        &self,
        socket: &UdpSocket,
        src: SocketAddr,
        domain: &str,
        response: &Message,
    ) -> Result<(), CoreError> {
        self.policy.apply_side_effects(domain, response).await;

        let wire = response
            .to_vec()
            .map_err(|e| CoreError::Query(format!("failed to pack response: {e}")))?;

        time::timeout(self.timeout, socket.send_to(&wire, src))
            .await
            .map_err(|_| CoreError::Query("send to client timed out".into()))?
            .map_err(|e| CoreError::Query(format!("send to client failed: {e}")))?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn colon_port_binds_to_unspecified_v4() {
        assert_eq!(normalize_listen_addr(":53"), "0.0.0.0:53");
        assert_eq!(normalize_listen_addr("127.0.0.1:53"), "127.0.0.1:53");
    }

    #[test]
    fn defaults_apply_for_non_positive_values() {
        let (timeout, concurrency, queue_size) = resolve_defaults(0, 0, 0);
        assert_eq!(timeout, Duration::from_secs(DEFAULT_TIMEOUT_SECS));
        assert_eq!(concurrency, DEFAULT_CONCURRENCY);
        assert_eq!(queue_size, DEFAULT_CONCURRENCY * 5);
    }

    #[test]
    fn empty_upstream_list_is_rejected() {
        let policy = Arc::new(Policy::new());
        let err = Dispatcher::new(
            DEFAULT_LISTEN_ADDR,
            vec![],
            Duration::from_secs(1),
            1,
            5,
            policy,
            None,
        )
        .unwrap_err();
        assert!(matches!(err, CoreError::Config(_)));
    }
}
