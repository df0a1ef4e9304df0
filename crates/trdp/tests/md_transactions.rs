// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! MD end-to-end tests over loopback.
//!
//! The replier binds the well-known MD port of its configuration; the
//! requester rides an ephemeral port, so both sessions coexist on one
//! host. Ports are unique per test.

use std::net::Ipv4Addr;
use std::time::{Duration, Instant};

use trdp::{
    EventResult, Flags, ReplyStatus, SendParam, Session, SessionConfig, TrdpEvent, Uuid,
};

const MSG_MN: u16 = 0x4D6E;
const MSG_MP: u16 = 0x4D70;
const MSG_MQ: u16 = 0x4D71;
const MSG_MC: u16 = 0x4D63;

fn session_on(md_port: u16) -> Session {
    let mut cfg = SessionConfig {
        own_ip: Ipv4Addr::LOCALHOST,
        ..SessionConfig::default()
    };
    cfg.md.udp_port = md_port;
    cfg.md.tcp_port = md_port;
    Session::open(cfg).expect("session")
}

fn pump(sessions: &[&Session]) -> Vec<TrdpEvent> {
    let mut events = Vec::new();
    for s in sessions {
        events.extend(s.process().expect("process"));
    }
    std::thread::sleep(Duration::from_millis(2));
    events
}

#[test]
fn request_reply_confirm_over_udp() {
    let replier = session_on(27501);
    let requester = session_on(27501);

    replier
        .add_listener(2000, "", Flags::empty())
        .expect("listener");
    let id = requester
        .md_request(
            2000,
            Ipv4Addr::LOCALHOST,
            "devA",
            "",
            &[1, 2, 3, 4],
            2_000_000,
            1,
            Flags::empty(),
            SendParam::default(),
        )
        .expect("request");

    let deadline = Instant::now() + Duration::from_secs(5);
    let mut replied = false;
    let mut confirmed_seen = false;
    let mut request_payload = Vec::new();
    while Instant::now() < deadline && !confirmed_seen {
        for event in pump(&[&replier, &requester]) {
            if let TrdpEvent::Md {
                listener,
                info,
                payload,
                result: EventResult::Ok,
            } = event
            {
                if listener.is_some() && info.msg_type == 0x4D72 {
                    // Replier side: incoming Mr
                    request_payload = payload;
                    replier
                        .md_reply_query(info.session_id, &[5, 6, 7, 8], ReplyStatus::Ok, "devB", 2_000_000)
                        .expect("reply_query");
                } else if info.msg_type == MSG_MQ {
                    // Requester side: reply expecting confirmation
                    assert_eq!(info.session_id, id);
                    assert_eq!(payload, [5, 6, 7, 8]);
                    assert!(!replied, "exactly one Mq expected");
                    replied = true;
                    requester.md_confirm(id, ReplyStatus::Ok).expect("confirm");
                } else if info.msg_type == MSG_MC {
                    // Replier side: confirmation arrived
                    confirmed_seen = true;
                }
            }
        }
    }

    assert_eq!(request_payload, [1, 2, 3, 4]);
    assert!(replied, "requester must see the Mq reply");
    assert!(confirmed_seen, "replier must see the Mc confirmation");

    let req_stats = requester.get_statistics().expect("stats");
    assert_eq!(req_stats.udp_md.reply_timeouts, 0);
    let rep_stats = replier.get_statistics().expect("stats");
    assert_eq!(rep_stats.udp_md.confirm_timeouts, 0);
}

#[test]
fn request_retries_then_reply_timeout() {
    // Nobody listens on this port
    let requester = session_on(27551);
    let id = requester
        .md_request(
            2000,
            Ipv4Addr::LOCALHOST,
            "",
            "",
            &[1],
            150_000,
            1,
            Flags::empty(),
            SendParam {
                retries: Some(2),
                ..SendParam::default()
            },
        )
        .expect("request");

    let deadline = Instant::now() + Duration::from_secs(5);
    let mut failed: Option<Uuid> = None;
    while Instant::now() < deadline && failed.is_none() {
        for event in pump(&[&requester]) {
            if let TrdpEvent::Md {
                info,
                result: EventResult::ReplyTimeout,
                ..
            } = event
            {
                failed = Some(info.session_id);
            }
        }
    }
    assert_eq!(failed, Some(id), "request must fail with ReplyTimeout");

    let stats = requester.get_statistics().expect("stats");
    assert_eq!(
        stats.udp_md.sent, 3,
        "retries=2 means at most three transmissions"
    );
    assert_eq!(stats.udp_md.reply_timeouts, 1);
}

#[test]
fn notification_is_fire_and_forget() {
    let replier = session_on(27601);
    let requester = session_on(27601);

    replier
        .add_listener(2100, "", Flags::empty())
        .expect("listener");
    requester
        .notify(2100, Ipv4Addr::LOCALHOST, "devA", "", &[7, 7, 7], Flags::empty())
        .expect("notify");

    let deadline = Instant::now() + Duration::from_secs(5);
    let mut seen = false;
    'outer: while Instant::now() < deadline {
        for event in pump(&[&replier, &requester]) {
            if let TrdpEvent::Md { info, payload, .. } = event {
                assert_eq!(info.msg_type, MSG_MN);
                assert_eq!(payload, [7, 7, 7]);
                seen = true;
                break 'outer;
            }
        }
    }
    assert!(seen, "notification must reach the listener");
}

#[test]
fn request_reply_over_tcp() {
    let replier = session_on(27651);
    let requester = session_on(27651);

    replier.add_listener(2200, "", Flags::TCP).expect("listener");
    // Give the listener a tick to be registered before connecting
    pump(&[&replier]);

    let id = requester
        .md_request(
            2200,
            Ipv4Addr::LOCALHOST,
            "devA",
            "",
            &[1, 2, 3],
            3_000_000,
            1,
            Flags::TCP,
            SendParam::default(),
        )
        .expect("request");

    let deadline = Instant::now() + Duration::from_secs(5);
    let mut got_reply = false;
    'outer: while Instant::now() < deadline {
        for event in pump(&[&replier, &requester]) {
            if let TrdpEvent::Md {
                listener,
                info,
                payload,
                result: EventResult::Ok,
            } = event
            {
                if listener.is_some() && info.msg_type == 0x4D72 {
                    assert_eq!(payload, [1, 2, 3]);
                    replier
                        .md_reply(info.session_id, &[9, 9], ReplyStatus::Ok, "devB")
                        .expect("reply");
                } else if info.msg_type == MSG_MP {
                    assert_eq!(info.session_id, id);
                    assert_eq!(payload, [9, 9]);
                    got_reply = true;
                    break 'outer;
                }
            }
        }
    }
    assert!(got_reply, "TCP request must complete with an Mp reply");

    let stats = requester.get_statistics().expect("stats");
    assert_eq!(stats.tcp_md.reply_timeouts, 0);
}
