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

//! A single-shot UDP upstream resolver call, bounded by a timeout.

use crate::error::CoreError;
use std::{io, time::Duration};
use tokio::{net::UdpSocket, time};
use trust_dns_proto::op::Message;

/// Send `wire` unchanged to `upstream` and return the parsed response.
/// The socket is opened fresh for this call and closed on every exit path
/// (by being dropped at the end of the function).
pub async fn resolve(upstream: &str, wire: &[u8], timeout: Duration) -> Result<Message, CoreError> {
    let fail = |source: io::Error| CoreError::Upstream {
        upstream: upstream.to_string(),
        source,
    };
    let timed_out = || {
        fail(io::Error::new(
            io::ErrorKind::TimedOut,
            "upstream call exceeded the configured timeout",
        ))
    };

    let mut addrs = time::timeout(timeout, tokio::net::lookup_host(upstream))
        .await
        .map_err(|_| timed_out())?
        .map_err(fail)?;
    let addr = addrs.next().ok_or_else(|| {
        fail(io::Error::new(
            io::ErrorKind::AddrNotAvailable,
            "upstream address did not resolve",
        ))
    })?;

    let bind_addr = if addr.is_ipv4() { "0.0.0.0:0" } else { "[::]:0" };
    let socket = UdpSocket::bind(bind_addr).await.map_err(fail)?;
    socket.connect(addr).await.map_err(fail)?;

    time::timeout(timeout, socket.send(wire))
        .await
        .map_err(|_| timed_out())?
        .map_err(fail)?;

    let mut buf = [0u8; 512];
    let n = time::timeout(timeout, socket.recv(&mut buf))
        .await
        .map_err(|_| timed_out())?
        .map_err(fail)?;

    Message::from_vec(&buf[..n]).map_err(|source| CoreError::UpstreamParse {
        upstream: upstream.to_string(),
        source,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::UdpSocket as TokioUdpSocket;
    use trust_dns_proto::{
        op::{Message, MessageType, Query},
        rr::{rdata::A, Name, RData, Record, RecordType},
    };

    fn build_query(id: u16, name: &str) -> Message {
        let mut msg = Message::new();
        msg.set_id(id);
        msg.add_query(Query::query(Name::from_ascii(name).unwrap(), RecordType::A));
        msg
    }

    fn build_response(request: &Message, ip: std::net::Ipv4Addr) -> Message {
        let mut resp = request.clone();
        resp.set_message_type(MessageType::Response);
        let name = request.queries()[0].name().clone();
        resp.add_answer(Record::from_rdata(name, 60, RData::A(A(ip))));
        resp
    }

    #[tokio::test]
    async fn resolve_round_trips_through_a_mock_upstream() {
        let server = TokioUdpSocket::bind("127.0.0.1:0").await.unwrap();
        let upstream_addr = server.local_addr().unwrap();

        let responder = tokio::spawn(async move {
            let mut buf = [0u8; 512];
            let (n, src) = server.recv_from(&mut buf).await.unwrap();
            let req = Message::from_vec(&buf[..n]).unwrap();
            let resp = build_response(&req, std::net::Ipv4Addr::new(1, 2, 3, 4));
            server.send_to(&resp.to_vec().unwrap(), src).await.unwrap();
        });

        let query = build_query(0x4242, "a.test.");
        let resp = resolve(
            &upstream_addr.to_string(),
            &query.to_vec().unwrap(),
            Duration::from_secs(2),
        )
        .await
        .unwrap();

        assert_eq!(resp.id(), 0x4242);
        assert_eq!(resp.answers().len(), 1);
        responder.await.unwrap();
    }

    #[tokio::test]
    async fn resolve_times_out_against_a_silent_upstream() {
        let server = TokioUdpSocket::bind("127.0.0.1:0").await.unwrap();
        let upstream_addr = server.local_addr().unwrap();
        // Keep the socket alive but never respond.
        let _keepalive = server;

        let query = build_query(1, "timeout.test.");
        let result = resolve(
            &upstream_addr.to_string(),
            &query.to_vec().unwrap(),
            Duration::from_millis(50),
        )
        .await;
        assert!(result.is_err());
    }
}
