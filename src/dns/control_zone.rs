//! Control-Zone Responder: synthesises diagnostic TXT answers for four
//! well-known names under a configured suffix, without ever touching the
//! upstream resolver.

use hickory_proto::op::{Message, MessageType, OpCode};
use hickory_proto::rr::rdata::TXT;
use hickory_proto::rr::{DNSClass, Name, RData, Record, RecordType};

use super::framing;

/// The four synthetic names this zone answers, relative to a configured
/// suffix (e.g. `ip.<suffix>`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ControlName {
    Ip,
    Uuid,
    Time,
    Version,
}

/// Build information surfaced by the `version.<zone>` diagnostic name.
#[derive(Debug, Clone, Copy)]
pub struct VersionInfo {
    pub version: &'static str,
    pub built_on: &'static str,
    pub revision: &'static str,
}

/// Attempt to answer `msg_with_len` as a control-zone query.
///
/// Returns `None` ("not mine") on any parse failure, a question count other
/// than one, a question that isn't class IN type TXT, or a name that
/// doesn't match one of the four synthetic names under `zone_suffix`.
/// `remote_addr` is the textual `host:port` (or bare host) of the peer, used
/// verbatim for the `ip.<zone>` answer.
pub fn try_answer(
    zone_suffix: Option<&str>,
    remote_addr: &str,
    msg_with_len: &[u8],
    version_info: &VersionInfo,
) -> Option<Vec<u8>> {
    let zone_suffix = zone_suffix?;
    let payload = framing::split_length_prefix(msg_with_len).ok()?;
    let request = Message::from_vec(payload).ok()?;

    if request.queries().len() != 1 {
        return None;
    }
    let question = &request.queries()[0];
    if question.query_class() != DNSClass::IN || question.query_type() != RecordType::TXT {
        return None;
    }

    let control_name = classify(question.name(), zone_suffix)?;
    let answer_text = match control_name {
        ControlName::Ip => split_host(remote_addr),
        ControlName::Uuid => uuid::Uuid::new_v4().to_string(),
        ControlName::Time => chrono::Utc::now().to_rfc3339(),
        ControlName::Version => format!(
            "{} (Variant: {}-{}, Built on: {}, Revision: {})",
            version_info.version,
            std::env::consts::OS,
            std::env::consts::ARCH,
            version_info.built_on,
            version_info.revision,
        ),
    };

    build_reply(&request, question.name().clone(), &answer_text)
}

/// Classify a question name against the four synthetic names, all of which
/// live directly under `zone_suffix` (itself already dot-terminated).
fn classify(name: &Name, zone_suffix: &str) -> Option<ControlName> {
    let suffix = Name::parse(zone_suffix, None).ok()?;
    for (label, variant) in [
        ("ip", ControlName::Ip),
        ("uuid", ControlName::Uuid),
        ("time", ControlName::Time),
        ("version", ControlName::Version),
    ] {
        let candidate = Name::parse(label, Some(&suffix)).ok()?;
        if name == &candidate {
            return Some(variant);
        }
    }
    None
}

/// Split `host:port` into its host portion; if there's no port, the whole
/// string is used verbatim (matches `net.SplitHostPort`'s fallback).
fn split_host(remote_addr: &str) -> String {
    match remote_addr.rsplit_once(':') {
        // Only treat this as host:port if the right side is a bare port
        // number (otherwise it's an unbracketed IPv6 literal with no port).
        Some((host, port)) if port.chars().all(|c| c.is_ascii_digit()) && !host.is_empty() => {
            host.trim_start_matches('[').trim_end_matches(']').to_string()
        }
        _ => remote_addr.to_string(),
    }
}

fn build_reply(request: &Message, question_name: Name, answer_text: &str) -> Option<Vec<u8>> {
    let mut reply = Message::new();
    reply.set_id(request.id());
    reply.set_message_type(MessageType::Response);
    reply.set_op_code(OpCode::Query);
    reply.add_query(request.queries()[0].clone());

    let record = Record::from_rdata(
        question_name,
        0,
        RData::TXT(TXT::new(vec![answer_text.to_string()])),
    );
    reply.add_answer(record);

    let encoded = reply.to_vec().ok()?;
    Some(framing::with_length_prefix(&encoded))
}

#[cfg(test)]
mod tests {
    use super::*;
    use hickory_proto::op::Query;

    fn query_with_name(name: &str) -> Vec<u8> {
        let mut message = Message::new();
        message.set_id(0x1234);
        message.set_message_type(MessageType::Query);
        message.set_op_code(OpCode::Query);
        let mut query = Query::new();
        query.set_name(Name::parse(name, None).unwrap());
        query.set_query_type(RecordType::TXT);
        query.set_query_class(DNSClass::IN);
        message.add_query(query);
        framing::with_length_prefix(&message.to_vec().unwrap())
    }

    fn version_info() -> VersionInfo {
        VersionInfo { version: "1.0.0", built_on: "2026-01-01", revision: "abc123" }
    }

    #[test]
    fn answers_ip_query_with_peer_host() {
        let wire = query_with_name("ip.ctrl.example.com.");
        let reply = try_answer(
            Some("ctrl.example.com."),
            "192.0.2.7:12345",
            &wire,
            &version_info(),
        )
        .expect("control zone should answer");

        let payload = framing::split_length_prefix(&reply).unwrap();
        let parsed = Message::from_vec(payload).unwrap();
        assert!(parsed.header().response_code() == hickory_proto::op::ResponseCode::NoError);
        assert_eq!(parsed.answers().len(), 1);
        match parsed.answers()[0].data() {
            Some(RData::TXT(txt)) => {
                let rendered = txt.iter().map(|b| String::from_utf8_lossy(b)).collect::<String>();
                assert_eq!(rendered, "192.0.2.7");
            }
            _ => panic!("expected TXT rdata"),
        }
    }

    #[test]
    fn falls_through_on_unrelated_name() {
        let wire = query_with_name("www.example.com.");
        assert!(try_answer(Some("ctrl.example.com."), "192.0.2.7:1", &wire, &version_info()).is_none());
    }

    #[test]
    fn falls_through_without_configured_zone() {
        let wire = query_with_name("ip.ctrl.example.com.");
        assert!(try_answer(None, "192.0.2.7:1", &wire, &version_info()).is_none());
    }

    #[test]
    fn split_host_handles_bare_ip() {
        assert_eq!(split_host("192.0.2.7"), "192.0.2.7");
        assert_eq!(split_host("192.0.2.7:12345"), "192.0.2.7");
    }
}
