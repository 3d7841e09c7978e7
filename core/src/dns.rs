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

//! Wire-message helpers shared by the dispatcher: normalizing the query
//! domain, synthesising an address answer, and building a response from a
//! cached message.

use std::net::IpAddr;
use trust_dns_proto::{
    op::{Message, MessageType},
    rr::{
        rdata::{A, AAAA},
        RData, Record, RecordType,
    },
};

const SYNTH_TTL: u32 = 60;

/// Lowercase the first question's name and strip a trailing dot.
pub fn first_question_domain(msg: &Message) -> Option<String> {
    let q = msg.queries().first()?;
    let name = q.name().to_utf8().to_ascii_lowercase();
    Some(name.trim_end_matches('.').to_string())
}

/// True if every question in `msg` is of type A or AAAA.
pub fn all_questions_are_a_or_aaaa(msg: &Message) -> bool {
    !msg.queries().is_empty()
        && msg
            .queries()
            .iter()
            .all(|q| matches!(q.query_type(), RecordType::A | RecordType::AAAA))
}

/// True if `msg` carries at least one answer and every answer is A/AAAA.
pub fn answers_are_all_a_or_aaaa(msg: &Message) -> bool {
    !msg.answers().is_empty()
        && msg
            .answers()
            .iter()
            .all(|r| matches!(r.record_type(), RecordType::A | RecordType::AAAA))
}

/// Build a synthesised response: for every question, append an A/AAAA
/// record for every configured address, TTL 60, transaction ID unchanged.
pub fn synthesize_response(request: &Message, addresses: &[IpAddr]) -> Message {
    let mut resp = request.clone();
    resp.set_message_type(MessageType::Response);

    for q in request.queries() {
        for addr in addresses {
            let rdata = match addr {
                IpAddr::V4(v4) => RData::A(A(*v4)),
                IpAddr::V6(v6) => RData::AAAA(AAAA(*v6)),
            };
            let mut record = Record::from_rdata(q.name().clone(), SYNTH_TTL, rdata);
            record.set_dns_class(q.query_class());
            resp.add_answer(record);
        }
    }
    resp
}

/// Build a response out of a cached message: for every question, copy
/// every cached answer whose type matches the question's type. Returns
/// `None` if a non-A/AAAA cached record is encountered (defence-in-depth;
/// unreachable in practice since only all-A/AAAA responses are cached) or
/// if no answers were produced, signalling the caller to fall through to
/// the upstream path.
pub fn build_cache_response(request: &Message, cached: &Message) -> Option<Message> {
    let mut resp = request.clone();
    resp.set_message_type(MessageType::Response);

    for q in request.queries() {
        for answer in cached.answers() {
            if answer.record_type() != q.query_type() {
                continue;
            }
            match answer.record_type() {
                RecordType::A | RecordType::AAAA => resp.add_answer(answer.clone()),
                _ => return None,
            };
        }
    }

    if resp.answers().is_empty() {
        None
    } else {
        Some(resp)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use trust_dns_proto::op::Query;
    use trust_dns_proto::rr::Name;

    fn request(name: &str, qtype: RecordType) -> Message {
        let mut msg = Message::new();
        msg.set_id(0x1234);
        msg.add_query(Query::query(Name::from_ascii(name).unwrap(), qtype));
        msg
    }

    #[test]
    fn domain_is_lowercased_and_undotted() {
        let msg = request("A.Foo.TEST.", RecordType::A);
        assert_eq!(first_question_domain(&msg).as_deref(), Some("a.foo.test"));
    }

    #[test]
    fn synth_preserves_transaction_id_and_sets_response_flag() {
        let req = request("a.foo.test.", RecordType::A);
        let resp = synthesize_response(&req, &["10.0.0.1".parse().unwrap()]);
        assert_eq!(resp.id(), 0x1234);
        assert_eq!(resp.message_type(), MessageType::Response);
        assert_eq!(resp.answers().len(), 1);
        match resp.answers()[0].data() {
            Some(RData::A(a)) => assert_eq!(a.0, std::net::Ipv4Addr::new(10, 0, 0, 1)),
            other => panic!("unexpected rdata: {other:?}"),
        }
        assert_eq!(resp.answers()[0].ttl(), SYNTH_TTL);
    }

    #[test]
    fn cache_response_filters_by_question_type() {
        let req = request("a.test.", RecordType::A);
        let mut cached = request("a.test.", RecordType::A);
        cached.add_answer(Record::from_rdata(
            Name::from_ascii("a.test.").unwrap(),
            300,
            RData::A(A("1.2.3.4".parse().unwrap())),
        ));
        let resp = build_cache_response(&req, &cached).unwrap();
        assert_eq!(resp.answers().len(), 1);
    }

    #[test]
    fn cache_response_is_none_when_empty() {
        let req = request("a.test.", RecordType::AAAA);
        let mut cached = request("a.test.", RecordType::A);
        cached.add_answer(Record::from_rdata(
            Name::from_ascii("a.test.").unwrap(),
            300,
            RData::A(A("1.2.3.4".parse().unwrap())),
        ));
        assert!(build_cache_response(&req, &cached).is_none());
    }
}
