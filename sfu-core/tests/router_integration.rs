//! End-to-end routing scenarios: one producer, one or more consumers, real
//! packets through the router.

use sfu_core::channel::Notification;
use sfu_core::parameters::{
    ConsumerId, MediaKind, ProducerId, Profile, RouterId, RtcpFeedback, RtcpParameters,
    RtpCodecParameters, RtpEncodingParameters, RtpParameters, RtxParameters, TransportId,
};
use sfu_core::router::{Packet, Router, TaggedPacket};
use std::collections::HashMap;
use std::time::{Duration, Instant};

const PRODUCER_TRANSPORT: TransportId = TransportId(100);
const CONSUMER_TRANSPORT: TransportId = TransportId(101);

fn vp8_codecs() -> Vec<RtpCodecParameters> {
    vec![
        RtpCodecParameters {
            mime_type: "video/VP8".to_string(),
            payload_type: 96,
            clock_rate: 90000,
            rtcp_feedback: vec![
                RtcpFeedback {
                    typ: "nack".to_string(),
                    parameter: String::new(),
                },
                RtcpFeedback {
                    typ: "nack".to_string(),
                    parameter: "pli".to_string(),
                },
            ],
            ..Default::default()
        },
        RtpCodecParameters {
            mime_type: "video/rtx".to_string(),
            payload_type: 97,
            clock_rate: 90000,
            parameters: HashMap::from([("apt".to_string(), serde_json::json!(96))]),
            ..Default::default()
        },
    ]
}

fn producer_parameters(encodings: &[(u32, Option<Profile>)]) -> RtpParameters {
    RtpParameters {
        codecs: vp8_codecs(),
        encodings: encodings
            .iter()
            .map(|&(ssrc, profile)| RtpEncodingParameters {
                ssrc,
                profile,
                ..Default::default()
            })
            .collect(),
        rtcp: RtcpParameters {
            cname: "producer-endpoint".to_string(),
            ..Default::default()
        },
        ..Default::default()
    }
}

fn consumer_parameters(ssrc: u32) -> RtpParameters {
    RtpParameters {
        codecs: vp8_codecs(),
        encodings: vec![RtpEncodingParameters {
            ssrc,
            rtx: Some(RtxParameters { ssrc: ssrc + 1 }),
            ..Default::default()
        }],
        rtcp: RtcpParameters {
            cname: "consumer-endpoint".to_string(),
            ..Default::default()
        },
        ..Default::default()
    }
}

/// An RTP packet whose payload carries no VP8 descriptor (first byte has the
/// X bit clear), so the payload passes through byte-identical.
fn plain_packet(ssrc: u32, seq: u16, ts: u32, marker: u8) -> rtp::packet::Packet {
    rtp::packet::Packet {
        header: rtp::header::Header {
            ssrc,
            payload_type: 96,
            sequence_number: seq,
            timestamp: ts,
            ..Default::default()
        },
        payload: vec![0x00, marker].into(),
        ..Default::default()
    }
}

/// A VP8 packet with a two-byte pictureId and tl0PictureIndex.
fn vp8_packet(ssrc: u32, seq: u16, ts: u32, picture_id: u16) -> rtp::packet::Packet {
    let payload = vec![
        0x90, // X|S set
        0xE0, // I|L|T
        ((picture_id >> 8) as u8 & 0x7F) | 0x80,
        (picture_id & 0xFF) as u8,
        picture_id as u8, // tl0PictureIndex
        0x00,             // TID 0
        0x01,             // inter frame
        0xAA,
    ];
    rtp::packet::Packet {
        header: rtp::header::Header {
            ssrc,
            payload_type: 96,
            sequence_number: seq,
            timestamp: ts,
            ..Default::default()
        },
        payload: payload.into(),
        ..Default::default()
    }
}

fn drain_writes(router: &mut Router) -> Vec<TaggedPacket> {
    let mut out = Vec::new();
    while let Some(packet) = router.poll_write() {
        out.push(packet);
    }
    out
}

fn drain_rtp_for(router: &mut Router, transport: TransportId) -> Vec<rtp::packet::Packet> {
    drain_writes(router)
        .into_iter()
        .filter(|t| t.transport == transport)
        .filter_map(|t| match t.packet {
            Packet::Rtp(packet) => Some(packet),
            Packet::Rtcp(_) => None,
        })
        .collect()
}

fn drain_events(router: &mut Router) -> Vec<Notification> {
    let mut out = Vec::new();
    while let Some(notification) = router.poll_event() {
        out.push(notification);
    }
    out
}

/// Builds a router with producer 1 (given encodings) and consumer 7 enabled
/// on SSRC 2000.
fn setup(encodings: &[(u32, Option<Profile>)], now: Instant) -> Router {
    let mut router = Router::new(RouterId(1));
    router
        .create_producer(
            ProducerId(1),
            MediaKind::Video,
            PRODUCER_TRANSPORT,
            producer_parameters(encodings),
            false,
        )
        .unwrap();
    router.create_consumer(now, ConsumerId(7), ProducerId(1)).unwrap();
    router
        .enable_consumer(now, ConsumerId(7), CONSUMER_TRANSPORT, consumer_parameters(2000))
        .unwrap();
    router
}

#[test]
fn single_profile_forwarding() {
    let now = Instant::now();
    let mut router = setup(&[(1000, None)], now);

    for (i, (seq, ts)) in [(100u16, 9000u32), (101, 12600), (102, 16200)]
        .into_iter()
        .enumerate()
    {
        router.handle_rtp(now, plain_packet(1000, seq, ts, i as u8));
    }

    let out = drain_rtp_for(&mut router, CONSUMER_TRANSPORT);
    assert_eq!(out.len(), 3);

    for packet in &out {
        assert_eq!(packet.header.ssrc, 2000);
    }
    for window in out.windows(2) {
        assert_eq!(
            window[1].header.sequence_number,
            window[0].header.sequence_number.wrapping_add(1)
        );
    }
    assert_eq!(out[1].header.timestamp.wrapping_sub(out[0].header.timestamp), 3600);
    assert_eq!(out[2].header.timestamp.wrapping_sub(out[1].header.timestamp), 3600);

    // Payload bytes pass through unchanged.
    for (i, packet) in out.iter().enumerate() {
        assert_eq!(&packet.payload[..], &[0x00, i as u8]);
    }
}

#[test]
fn nack_answered_with_rtx_within_window() {
    let now = Instant::now();
    let mut router = setup(&[(1000, None)], now);

    for seq in [100u16, 101, 102] {
        router.handle_rtp(now, plain_packet(1000, seq, 9000, seq as u8));
    }
    let sent = drain_rtp_for(&mut router, CONSUMER_TRANSPORT);
    let remapped_101 = sent[1].header.sequence_number;

    // NACK for the second packet, bitmask 0.
    let nack = rtcp::transport_feedbacks::transport_layer_nack::TransportLayerNack {
        sender_ssrc: 9,
        media_ssrc: 2000,
        nacks: vec![rtcp::transport_feedbacks::transport_layer_nack::NackPair {
            packet_id: remapped_101,
            lost_packets: 0,
        }],
    };
    router.handle_rtcp(
        now,
        &[Box::new(nack) as Box<dyn rtcp::packet::Packet + Send + Sync>],
    );

    let rtx = drain_rtp_for(&mut router, CONSUMER_TRANSPORT);
    assert_eq!(rtx.len(), 1);
    assert_eq!(rtx[0].header.ssrc, 2001);
    assert_eq!(rtx[0].header.payload_type, 97);
    assert_eq!(&rtx[0].payload[..2], &remapped_101.to_be_bytes());
    assert_eq!(&rtx[0].payload[2..], &sent[1].payload[..]);

    // A NACK far outside the ring yields no transmission.
    let nack = rtcp::transport_feedbacks::transport_layer_nack::TransportLayerNack {
        sender_ssrc: 9,
        media_ssrc: 2000,
        nacks: vec![rtcp::transport_feedbacks::transport_layer_nack::NackPair {
            packet_id: remapped_101.wrapping_sub(5000),
            lost_packets: 0,
        }],
    };
    router.handle_rtcp(
        now,
        &[Box::new(nack) as Box<dyn rtcp::packet::Packet + Send + Sync>],
    );
    assert!(drain_rtp_for(&mut router, CONSUMER_TRANSPORT).is_empty());
}

#[test]
fn profile_switch_clears_buffer_and_resyncs() {
    let now = Instant::now();
    let mut router = setup(&[(1000, Some(Profile::Low)), (1100, Some(Profile::High))], now);
    router
        .set_consumer_preferred_profile(now, ConsumerId(7), Profile::High)
        .unwrap();

    // Activate both profiles.
    router.handle_rtp(now, plain_packet(1000, 10, 1000, 0));
    router.handle_rtp(now, plain_packet(1100, 500, 5000, 1));
    drain_events(&mut router);

    // Only HIGH is forwarded. The huge gap before the last packet makes the
    // HIGH stream's receiver report show heavy loss, so the profile will be
    // declared unhealthy on the next tick.
    router.handle_rtp(now, plain_packet(1100, 501, 8600, 2));
    router.handle_rtp(now, plain_packet(1100, 2500, 9000, 3));
    let sent = drain_rtp_for(&mut router, CONSUMER_TRANSPORT);
    let last_high = sent.last().expect("high profile forwarded").clone();

    let later = now + Duration::from_secs(2);
    router.handle_timeout(later);
    drain_writes(&mut router);

    let events = drain_events(&mut router);
    let profile_change = events
        .iter()
        .find(|n| n.event == "effectiveprofilechange")
        .expect("effective profile change notification");
    assert_eq!(profile_change.target_id, 7);
    assert_eq!(
        profile_change.data.as_ref().unwrap()["profile"],
        serde_json::json!("low")
    );

    // The retransmission buffer was cleared: the old packet is gone.
    let nack = rtcp::transport_feedbacks::transport_layer_nack::TransportLayerNack {
        sender_ssrc: 9,
        media_ssrc: 2000,
        nacks: vec![rtcp::transport_feedbacks::transport_layer_nack::NackPair {
            packet_id: last_high.header.sequence_number,
            lost_packets: 0,
        }],
    };
    router.handle_rtcp(
        later,
        &[Box::new(nack) as Box<dyn rtcp::packet::Packet + Send + Sync>],
    );
    assert!(drain_rtp_for(&mut router, CONSUMER_TRANSPORT).is_empty());

    // The next LOW packet continues the sequence by exactly one.
    router.handle_rtp(later, plain_packet(1000, 11, 90000, 4));
    let resumed = drain_rtp_for(&mut router, CONSUMER_TRANSPORT);
    assert_eq!(resumed.len(), 1);
    assert_eq!(
        resumed[0].header.sequence_number,
        last_high.header.sequence_number.wrapping_add(1)
    );
    // Timestamps never go backwards.
    assert!(
        resumed[0]
            .header
            .timestamp
            .wrapping_sub(last_high.header.timestamp)
            < (1 << 31)
    );
}

#[test]
fn paused_consumer_forwards_nothing_and_resume_requests_pli() {
    let now = Instant::now();
    let mut router = setup(&[(1000, None)], now);

    // Activate the profile, then clear the setup chatter.
    router.handle_rtp(now, plain_packet(1000, 1, 0, 0));
    drain_writes(&mut router);
    drain_events(&mut router);

    router.pause_consumer(now, ConsumerId(7)).unwrap();
    for seq in 2..12u16 {
        router.handle_rtp(now, plain_packet(1000, seq, 0, 0));
    }
    assert!(drain_rtp_for(&mut router, CONSUMER_TRANSPORT).is_empty());

    // Resume past the PLI coalescing window: one full-frame request reaches
    // the producer's transport.
    let later = now + Duration::from_secs(3);
    router.resume_consumer(later, ConsumerId(7)).unwrap();

    let plis: Vec<TaggedPacket> = drain_writes(&mut router)
        .into_iter()
        .filter(|t| t.transport == PRODUCER_TRANSPORT)
        .collect();
    let has_pli = plis.iter().any(|t| match &t.packet {
        Packet::Rtcp(batch) => batch.iter().any(|p| {
            p.as_any()
                .downcast_ref::<rtcp::payload_feedbacks::picture_loss_indication::PictureLossIndication>()
                .is_some()
        }),
        Packet::Rtp(_) => false,
    });
    assert!(has_pli, "resume must request a full frame of the producer");

    // Subsequent packets flow again.
    router.handle_rtp(later, plain_packet(1000, 12, 0, 0));
    assert_eq!(drain_rtp_for(&mut router, CONSUMER_TRANSPORT).len(), 1);
}

#[test]
fn producer_close_cascades_to_consumers() {
    let now = Instant::now();
    let mut router = setup(&[(1000, None)], now);
    router.create_consumer(now, ConsumerId(8), ProducerId(1)).unwrap();
    router
        .enable_consumer(now, ConsumerId(8), TransportId(102), consumer_parameters(3000))
        .unwrap();
    drain_events(&mut router);

    router.close_producer(ProducerId(1)).unwrap();

    let events = drain_events(&mut router);
    let closed: Vec<u32> = events
        .iter()
        .filter(|n| n.event == "close")
        .map(|n| n.target_id)
        .collect();
    assert!(closed.contains(&7));
    assert!(closed.contains(&8));
    assert!(closed.contains(&1));

    // The fan-out table is empty; nothing is forwarded any more.
    let dump = router.dump();
    assert_eq!(dump["producerIds"], serde_json::json!([]));
    assert_eq!(dump["consumerIds"], serde_json::json!([]));

    router.handle_rtp(now, plain_packet(1000, 2, 0, 0));
    assert!(drain_writes(&mut router).is_empty());
}

#[test]
fn producer_pause_mirrors_to_consumers() {
    let now = Instant::now();
    let mut router = setup(&[(1000, None)], now);
    router.handle_rtp(now, plain_packet(1000, 1, 0, 0));
    drain_writes(&mut router);
    drain_events(&mut router);

    router.pause_producer(now, ProducerId(1)).unwrap();
    let events = drain_events(&mut router);
    assert!(events.iter().any(|n| n.event == "sourcepaused" && n.target_id == 7));

    // Paused at the source: packets are swallowed by the producer.
    router.handle_rtp(now, plain_packet(1000, 2, 0, 0));
    assert!(drain_rtp_for(&mut router, CONSUMER_TRANSPORT).is_empty());

    let later = now + Duration::from_secs(3);
    router.resume_producer(later, ProducerId(1)).unwrap();
    let events = drain_events(&mut router);
    assert!(events.iter().any(|n| n.event == "sourceresumed" && n.target_id == 7));

    router.handle_rtp(later, plain_packet(1000, 3, 0, 0));
    assert_eq!(drain_rtp_for(&mut router, CONSUMER_TRANSPORT).len(), 1);
}

#[test]
fn vp8_picture_ids_rewritten_contiguously() {
    let now = Instant::now();
    let mut router = setup(&[(1000, None)], now);

    // Producer pictureIds start at an arbitrary value.
    for (i, picture_id) in [5000u16, 5001, 5002].into_iter().enumerate() {
        router.handle_rtp(now, vp8_packet(1000, 100 + i as u16, 9000, picture_id));
    }

    let out = drain_rtp_for(&mut router, CONSUMER_TRANSPORT);
    assert_eq!(out.len(), 3);

    let picture_ids: Vec<u16> = out
        .iter()
        .map(|p| {
            assert_eq!(p.payload[2] & 0x80, 0x80, "two-byte pictureId form");
            (u16::from(p.payload[2] & 0x7F) << 8) | u16::from(p.payload[3])
        })
        .collect();

    // Contiguous in the consumer's output space.
    assert_eq!(picture_ids[1], picture_ids[0].wrapping_add(1));
    assert_eq!(picture_ids[2], picture_ids[1].wrapping_add(1));
}

#[test]
fn producer_emits_receiver_reports_and_nacks() {
    let now = Instant::now();
    let mut router = setup(&[(1000, None)], now);

    router.handle_rtp(now, plain_packet(1000, 10, 0, 0));
    router.handle_rtp(now, plain_packet(1000, 13, 0, 0));
    drain_writes(&mut router);

    // Early enough that the gap is still worth a NACK, late enough that it
    // passed the NACK delay; the first receiver report has no cadence guard.
    router.handle_timeout(now + Duration::from_millis(100));

    let to_producer: Vec<TaggedPacket> = drain_writes(&mut router)
        .into_iter()
        .filter(|t| t.transport == PRODUCER_TRANSPORT)
        .collect();

    let mut saw_nack = false;
    let mut saw_rr = false;
    for tagged in &to_producer {
        if let Packet::Rtcp(batch) = &tagged.packet {
            for packet in batch {
                if packet
                    .as_any()
                    .downcast_ref::<rtcp::transport_feedbacks::transport_layer_nack::TransportLayerNack>()
                    .is_some()
                {
                    saw_nack = true;
                }
                if let Some(rr) = packet
                    .as_any()
                    .downcast_ref::<rtcp::receiver_report::ReceiverReport>()
                {
                    saw_rr = true;
                    assert_eq!(rr.reports[0].ssrc, 1000);
                }
            }
        }
    }
    assert!(saw_nack, "gap must trigger a NACK toward the source");
    assert!(saw_rr, "tick must produce a receiver report");
}

#[test]
fn consumer_emits_sender_reports_on_tick() {
    let now = Instant::now();
    let mut router = setup(&[(1000, None)], now);

    router.handle_rtp(now, plain_packet(1000, 1, 0, 0));
    drain_writes(&mut router);

    router.handle_timeout(now + Duration::from_secs(2));

    let mut saw_sr = false;
    for tagged in drain_writes(&mut router) {
        if tagged.transport != CONSUMER_TRANSPORT {
            continue;
        }
        if let Packet::Rtcp(batch) = &tagged.packet {
            for packet in batch {
                if let Some(sr) = packet
                    .as_any()
                    .downcast_ref::<rtcp::sender_report::SenderReport>()
                {
                    saw_sr = true;
                    assert_eq!(sr.ssrc, 2000);
                }
            }
        }
    }
    assert!(saw_sr, "tick must produce a sender report for the consumer");
}

#[test]
fn producer_renegotiation_notifies_consumers_and_resyncs() {
    let now = Instant::now();
    let mut router = setup(&[(1000, None)], now);

    router.handle_rtp(now, plain_packet(1000, 100, 9000, 0));
    let sent = drain_rtp_for(&mut router, CONSUMER_TRANSPORT);
    let last = sent.last().unwrap().clone();
    drain_events(&mut router);

    // The source renegotiates onto a new SSRC.
    router
        .update_producer_parameters(now, ProducerId(1), producer_parameters(&[(5000, None)]))
        .unwrap();

    let events = drain_events(&mut router);
    assert!(events
        .iter()
        .any(|n| n.event == "parameterschange" && n.target_id == 7));

    // Packets on the new SSRC reach the consumer, spliced with a sequence
    // step of one.
    router.handle_rtp(now, plain_packet(5000, 40000, 100, 1));
    let resumed = drain_rtp_for(&mut router, CONSUMER_TRANSPORT);
    assert_eq!(resumed.len(), 1);
    assert_eq!(
        resumed[0].header.sequence_number,
        last.header.sequence_number.wrapping_add(1)
    );
}

#[test]
fn unknown_ssrc_is_ignored() {
    let now = Instant::now();
    let mut router = setup(&[(1000, None)], now);

    router.handle_rtp(now, plain_packet(4242, 1, 0, 0));
    assert!(drain_writes(&mut router).is_empty());
}
