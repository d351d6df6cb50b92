//! Router: owns the producer/consumer tables and the fan-out relation.
//!
//! Everything lives in id-keyed arenas; cross-references are ids, never
//! pointers. A packet fan-out snapshots the subscribed consumer ids and runs
//! to completion before anything else is processed, so a consumer can never
//! observe a half-applied producer mutation.
//!
//! The router is a sans-IO machine: inbound packets enter through
//! `handle_rtp`/`handle_rtcp`, time enters through `handle_timeout`, and the
//! embedder drains outbound packets with `poll_write` and notifications with
//! `poll_event`.

use crate::channel::Notification;
use crate::consumer::{Consumer, ConsumerEvent, ConsumerOut};
use crate::parameters::{
    ConsumerId, MediaKind, ProducerId, Profile, RouterId, RtpParameters, TransportId,
};
use crate::producer::{Producer, ProducerEvent};
use crate::stream::NackConfig;
use log::debug;
use rtcp::payload_feedbacks::full_intra_request::FullIntraRequest;
use rtcp::payload_feedbacks::picture_loss_indication::PictureLossIndication;
use rtcp::receiver_report::ReceiverReport;
use rtcp::sender_report::SenderReport;
use rtcp::transport_feedbacks::transport_layer_nack::TransportLayerNack;
use sfu_shared::{Error, Result};
use std::collections::{HashMap, HashSet, VecDeque};
use std::time::{Duration, Instant};

/// Granularity of the periodic tick driving RTCP and NACK emission.
const TIMER_INTERVAL: Duration = Duration::from_millis(40);

/// An outbound packet, parsed form.
pub enum Packet {
    Rtp(rtp::packet::Packet),
    Rtcp(Vec<Box<dyn rtcp::packet::Packet + Send + Sync>>),
}

/// An outbound packet tagged with the transport that must carry it.
pub struct TaggedPacket {
    pub transport: TransportId,
    pub packet: Packet,
}

pub struct Router {
    id: RouterId,
    producers: HashMap<ProducerId, Producer>,
    consumers: HashMap<ConsumerId, Consumer>,
    /// Fan-out relation.
    subscriptions: HashMap<ProducerId, HashSet<ConsumerId>>,
    /// Inbound SSRC (media and RTX) to owning producer.
    producer_ssrcs: HashMap<u32, ProducerId>,
    /// Outbound SSRC (media and RTX) to owning consumer.
    consumer_ssrcs: HashMap<u32, ConsumerId>,

    nack_config: NackConfig,
    notifications: VecDeque<Notification>,
    write_queue: VecDeque<TaggedPacket>,
    eto: Instant,
}

impl Router {
    pub fn new(id: RouterId) -> Self {
        Self::with_nack_config(id, NackConfig::default())
    }

    pub fn with_nack_config(id: RouterId, nack_config: NackConfig) -> Self {
        Self {
            id,
            producers: HashMap::new(),
            consumers: HashMap::new(),
            subscriptions: HashMap::new(),
            producer_ssrcs: HashMap::new(),
            consumer_ssrcs: HashMap::new(),
            nack_config,
            notifications: VecDeque::new(),
            write_queue: VecDeque::new(),
            eto: Instant::now(),
        }
    }

    pub fn id(&self) -> RouterId {
        self.id
    }

    pub fn has_producer(&self, id: ProducerId) -> bool {
        self.producers.contains_key(&id)
    }

    pub fn has_consumer(&self, id: ConsumerId) -> bool {
        self.consumers.contains_key(&id)
    }

    pub fn create_producer(
        &mut self,
        id: ProducerId,
        kind: MediaKind,
        transport: TransportId,
        rtp_parameters: RtpParameters,
        paused: bool,
    ) -> Result<()> {
        if self.producers.contains_key(&id) {
            return Err(Error::ErrDuplicatedId);
        }
        for encoding in &rtp_parameters.encodings {
            if self.producer_ssrcs.contains_key(&encoding.ssrc) {
                return Err(Error::ErrDuplicatedSsrc);
            }
        }

        let producer = Producer::new(
            id,
            kind,
            transport,
            rtp_parameters.clone(),
            paused,
            self.nack_config.clone(),
        )?;

        for encoding in &rtp_parameters.encodings {
            self.producer_ssrcs.insert(encoding.ssrc, id);
            if let Some(rtx) = &encoding.rtx {
                if rtx.ssrc != 0 {
                    self.producer_ssrcs.insert(rtx.ssrc, id);
                }
            }
        }
        self.subscriptions.insert(id, HashSet::new());
        self.producers.insert(id, producer);

        debug!("producer created [producer_id:{}]", id.0);
        Ok(())
    }

    /// Closing a producer closes every subscribed consumer in the same tick.
    pub fn close_producer(&mut self, id: ProducerId) -> Result<()> {
        if !self.producers.contains_key(&id) {
            return Err(Error::ErrProducerNotFound);
        }

        let subscribed: Vec<ConsumerId> = self
            .subscriptions
            .remove(&id)
            .map(|set| set.into_iter().collect())
            .unwrap_or_default();
        for consumer_id in subscribed {
            self.destroy_consumer(consumer_id);
        }

        self.producers.remove(&id);
        self.producer_ssrcs.retain(|_, owner| *owner != id);
        self.notifications
            .push_back(Notification::new(id.0, "close", None));

        debug!("producer closed [producer_id:{}]", id.0);
        Ok(())
    }

    /// Creates a consumer already bound to its source producer. It stays
    /// uninitialised (no transport) until `enable_consumer`.
    pub fn create_consumer(
        &mut self,
        now: Instant,
        id: ConsumerId,
        source_producer_id: ProducerId,
    ) -> Result<()> {
        if self.consumers.contains_key(&id) {
            return Err(Error::ErrDuplicatedId);
        }
        let Some(producer) = self.producers.get(&source_producer_id) else {
            return Err(Error::ErrProducerNotFound);
        };

        let mut consumer = Consumer::new(id, producer.kind(), source_producer_id, now);
        if producer.is_paused() {
            consumer.source_pause();
        }

        self.subscriptions
            .entry(source_producer_id)
            .or_default()
            .insert(id);
        self.consumers.insert(id, consumer);
        self.drain_consumer_events(now, id);

        debug!(
            "consumer created [consumer_id:{}, producer_id:{}]",
            id.0, source_producer_id.0
        );
        Ok(())
    }

    pub fn close_consumer(&mut self, id: ConsumerId) -> Result<()> {
        if !self.consumers.contains_key(&id) {
            return Err(Error::ErrConsumerNotFound);
        }
        let source = self.consumers[&id].source_producer_id();
        if let Some(set) = self.subscriptions.get_mut(&source) {
            set.remove(&id);
        }
        self.destroy_consumer(id);
        Ok(())
    }

    /// Binds a transport and sending parameters to a consumer, creating its
    /// outbound stream. On failure the consumer stays in its prior state.
    pub fn enable_consumer(
        &mut self,
        now: Instant,
        id: ConsumerId,
        transport: TransportId,
        rtp_parameters: RtpParameters,
    ) -> Result<()> {
        let Some(consumer) = self.consumers.get_mut(&id) else {
            return Err(Error::ErrConsumerNotFound);
        };

        consumer.enable(transport, rtp_parameters)?;
        // Stale SSRC registrations of a prior enable.
        self.consumer_ssrcs.retain(|_, owner| *owner != id);
        for ssrc in consumer.ssrcs() {
            self.consumer_ssrcs.insert(ssrc, id);
        }

        // Seed the consumer with the profiles currently active upstream.
        let source = consumer.source_producer_id();
        let active: Vec<Profile> = self
            .producers
            .get(&source)
            .map(|p| p.active_profiles().iter().copied().collect())
            .unwrap_or_default();
        if let Some(consumer) = self.consumers.get_mut(&id) {
            for profile in active {
                consumer.add_profile(profile);
            }
        }
        self.drain_consumer_events(now, id);
        Ok(())
    }

    /// Transport loss: the consumer becomes disabled, retaining its
    /// parameters but releasing the outbound stream.
    pub fn disable_consumer(&mut self, now: Instant, id: ConsumerId) -> Result<()> {
        let Some(consumer) = self.consumers.get_mut(&id) else {
            return Err(Error::ErrConsumerNotFound);
        };
        consumer.disable();
        self.consumer_ssrcs.retain(|_, owner| *owner != id);
        self.drain_consumer_events(now, id);
        Ok(())
    }

    /// Renegotiation of a producer's parameters: surviving SSRCs keep their
    /// stream state, subscribed consumers resync and are notified.
    pub fn update_producer_parameters(
        &mut self,
        now: Instant,
        id: ProducerId,
        rtp_parameters: RtpParameters,
    ) -> Result<()> {
        let Some(producer) = self.producers.get_mut(&id) else {
            return Err(Error::ErrProducerNotFound);
        };
        producer.update_rtp_parameters(rtp_parameters.clone())?;

        self.producer_ssrcs.retain(|_, owner| *owner != id);
        for encoding in &rtp_parameters.encodings {
            self.producer_ssrcs.insert(encoding.ssrc, id);
            if let Some(rtx) = &encoding.rtx {
                if rtx.ssrc != 0 {
                    self.producer_ssrcs.insert(rtx.ssrc, id);
                }
            }
        }

        self.drain_producer_events(now, id);
        for consumer_id in self.subscribed(id) {
            if let Some(consumer) = self.consumers.get_mut(&consumer_id) {
                consumer.source_rtp_parameters_updated();
            }
            self.drain_consumer_events(now, consumer_id);
        }
        Ok(())
    }

    pub fn pause_producer(&mut self, now: Instant, id: ProducerId) -> Result<()> {
        let Some(producer) = self.producers.get_mut(&id) else {
            return Err(Error::ErrProducerNotFound);
        };
        if !producer.pause() {
            return Ok(());
        }
        for consumer_id in self.subscribed(id) {
            if let Some(consumer) = self.consumers.get_mut(&consumer_id) {
                consumer.source_pause();
            }
            self.drain_consumer_events(now, consumer_id);
        }
        Ok(())
    }

    pub fn resume_producer(&mut self, now: Instant, id: ProducerId) -> Result<()> {
        let Some(producer) = self.producers.get_mut(&id) else {
            return Err(Error::ErrProducerNotFound);
        };
        if !producer.resume() {
            return Ok(());
        }
        for consumer_id in self.subscribed(id) {
            if let Some(consumer) = self.consumers.get_mut(&consumer_id) {
                consumer.source_resume();
            }
            self.drain_consumer_events(now, consumer_id);
        }
        Ok(())
    }

    pub fn pause_consumer(&mut self, now: Instant, id: ConsumerId) -> Result<()> {
        let Some(consumer) = self.consumers.get_mut(&id) else {
            return Err(Error::ErrConsumerNotFound);
        };
        consumer.pause();
        self.drain_consumer_events(now, id);
        Ok(())
    }

    pub fn resume_consumer(&mut self, now: Instant, id: ConsumerId) -> Result<()> {
        let Some(consumer) = self.consumers.get_mut(&id) else {
            return Err(Error::ErrConsumerNotFound);
        };
        consumer.resume();
        self.drain_consumer_events(now, id);
        Ok(())
    }

    pub fn set_consumer_preferred_profile(
        &mut self,
        now: Instant,
        id: ConsumerId,
        profile: Profile,
    ) -> Result<()> {
        let Some(consumer) = self.consumers.get_mut(&id) else {
            return Err(Error::ErrConsumerNotFound);
        };
        consumer.set_preferred_profile(profile);
        self.drain_consumer_events(now, id);
        Ok(())
    }

    pub fn request_consumer_full_frame(&mut self, now: Instant, id: ConsumerId) -> Result<()> {
        let Some(consumer) = self.consumers.get_mut(&id) else {
            return Err(Error::ErrConsumerNotFound);
        };
        consumer.request_full_frame();
        self.drain_consumer_events(now, id);
        Ok(())
    }

    pub fn dump_producer(&mut self, now: Instant, id: ProducerId) -> Result<serde_json::Value> {
        match self.producers.get_mut(&id) {
            Some(producer) => Ok(producer.dump(now)),
            None => Err(Error::ErrProducerNotFound),
        }
    }

    pub fn dump_consumer(&mut self, now: Instant, id: ConsumerId) -> Result<serde_json::Value> {
        match self.consumers.get_mut(&id) {
            Some(consumer) => Ok(consumer.dump(now)),
            None => Err(Error::ErrConsumerNotFound),
        }
    }

    /// One inbound RTP packet from a producer transport: dispatch by SSRC,
    /// update stream health, fan out to every subscribed consumer.
    pub fn handle_rtp(&mut self, now: Instant, packet: rtp::packet::Packet) {
        let ssrc = packet.header.ssrc;
        let Some(&producer_id) = self.producer_ssrcs.get(&ssrc) else {
            debug!("no producer for inbound packet [ssrc:{ssrc}]");
            return;
        };

        let Some(producer) = self.producers.get_mut(&producer_id) else {
            return;
        };
        let forward = producer.receive_rtp_packet(now, packet);

        // Profile availability changes land on the consumers before the
        // packet itself does.
        self.drain_producer_events(now, producer_id);

        if let Some((mut media_packet, profile)) = forward {
            // Short-lived snapshot of the listener set; each consumer is
            // visited exactly once.
            for consumer_id in self.subscribed(producer_id) {
                if let Some(consumer) = self.consumers.get_mut(&consumer_id) {
                    consumer.send_rtp_packet(now, &mut media_packet, profile);
                }
                self.drain_consumer_events(now, consumer_id);
            }
        }

        self.sweep();
    }

    /// One inbound RTCP compound from any transport: demux by SSRC over
    /// producers (SR) and consumers (RR, NACK, PLI, FIR).
    pub fn handle_rtcp(
        &mut self,
        now: Instant,
        packets: &[Box<dyn rtcp::packet::Packet + Send + Sync>],
    ) {
        for packet in packets {
            let any = packet.as_any();

            if let Some(nack) = any.downcast_ref::<TransportLayerNack>() {
                if let Some(&consumer_id) = self.consumer_ssrcs.get(&nack.media_ssrc) {
                    if let Some(consumer) = self.consumers.get_mut(&consumer_id) {
                        consumer.receive_nack(now, nack);
                    }
                }
            } else if let Some(rr) = any.downcast_ref::<ReceiverReport>() {
                for report in &rr.reports {
                    if let Some(&consumer_id) = self.consumer_ssrcs.get(&report.ssrc) {
                        if let Some(consumer) = self.consumers.get_mut(&consumer_id) {
                            consumer.receive_receiver_report(now, report);
                        }
                    }
                }
            } else if let Some(sr) = any.downcast_ref::<SenderReport>() {
                if let Some(&producer_id) = self.producer_ssrcs.get(&sr.ssrc) {
                    if let Some(producer) = self.producers.get_mut(&producer_id) {
                        producer.receive_sender_report(now, sr);
                    }
                }
            } else if let Some(pli) = any.downcast_ref::<PictureLossIndication>() {
                self.key_frame_requested(now, pli.media_ssrc);
            } else if let Some(fir) = any.downcast_ref::<FullIntraRequest>() {
                for entry in &fir.fir {
                    self.key_frame_requested(now, entry.ssrc);
                }
            }
        }

        self.sweep();
    }

    /// Periodic work: producer NACK/RR generation, stream health, consumer
    /// Sender Reports.
    pub fn handle_timeout(&mut self, now: Instant) {
        if now < self.eto {
            return;
        }
        self.eto = now + TIMER_INTERVAL;

        let producer_ids: Vec<ProducerId> = self.producers.keys().copied().collect();
        for producer_id in producer_ids {
            if let Some(producer) = self.producers.get_mut(&producer_id) {
                producer.handle_timeout(now);
            }
            self.drain_producer_events(now, producer_id);
        }

        let consumer_ids: Vec<ConsumerId> = self.consumers.keys().copied().collect();
        for consumer_id in consumer_ids {
            if let Some(consumer) = self.consumers.get_mut(&consumer_id) {
                consumer.get_rtcp(now);
            }
        }

        self.sweep();
    }

    pub fn poll_timeout(&self) -> Instant {
        self.eto
    }

    pub fn poll_write(&mut self) -> Option<TaggedPacket> {
        self.write_queue.pop_front()
    }

    pub fn poll_event(&mut self) -> Option<Notification> {
        self.notifications.pop_front()
    }

    /// Closes every producer (and with them every consumer).
    pub fn close(&mut self) {
        let producer_ids: Vec<ProducerId> = self.producers.keys().copied().collect();
        for id in producer_ids {
            let _ = self.close_producer(id);
        }
        // Consumers without a live producer (shouldn't exist, but be safe).
        let consumer_ids: Vec<ConsumerId> = self.consumers.keys().copied().collect();
        for id in consumer_ids {
            self.destroy_consumer(id);
        }
    }

    pub fn dump(&self) -> serde_json::Value {
        let subscriptions: HashMap<String, Vec<u32>> = self
            .subscriptions
            .iter()
            .map(|(producer_id, consumers)| {
                let mut ids: Vec<u32> = consumers.iter().map(|c| c.0).collect();
                ids.sort_unstable();
                (producer_id.0.to_string(), ids)
            })
            .collect();
        let mut producer_ids: Vec<u32> = self.producers.keys().map(|p| p.0).collect();
        producer_ids.sort_unstable();
        let mut consumer_ids: Vec<u32> = self.consumers.keys().map(|c| c.0).collect();
        consumer_ids.sort_unstable();

        serde_json::json!({
            "routerId": self.id,
            "producerIds": producer_ids,
            "consumerIds": consumer_ids,
            "mapProducerConsumers": subscriptions,
        })
    }

    fn subscribed(&self, producer_id: ProducerId) -> Vec<ConsumerId> {
        self.subscriptions
            .get(&producer_id)
            .map(|set| {
                let mut ids: Vec<ConsumerId> = set.iter().copied().collect();
                ids.sort_unstable();
                ids
            })
            .unwrap_or_default()
    }

    /// Removes a consumer from every table and emits its close notification.
    fn destroy_consumer(&mut self, id: ConsumerId) {
        if self.consumers.remove(&id).is_none() {
            return;
        }
        self.consumer_ssrcs.retain(|_, owner| *owner != id);
        self.notifications
            .push_back(Notification::new(id.0, "close", None));
        debug!("consumer closed [consumer_id:{}]", id.0);
    }

    fn key_frame_requested(&mut self, now: Instant, media_ssrc: u32) {
        let Some(&consumer_id) = self.consumer_ssrcs.get(&media_ssrc) else {
            return;
        };
        let Some(consumer) = self.consumers.get(&consumer_id) else {
            return;
        };
        let producer_id = consumer.source_producer_id();
        let profile = consumer.effective_profile();
        if let Some(producer) = self.producers.get_mut(&producer_id) {
            producer.request_key_frame(now, profile);
        }
    }

    fn drain_producer_events(&mut self, now: Instant, producer_id: ProducerId) {
        loop {
            let event = match self.producers.get_mut(&producer_id) {
                Some(producer) => producer.pop_event(),
                None => return,
            };
            let Some(event) = event else {
                return;
            };

            for consumer_id in self.subscribed(producer_id) {
                if let Some(consumer) = self.consumers.get_mut(&consumer_id) {
                    match event {
                        ProducerEvent::ProfileEnabled(profile) => consumer.add_profile(profile),
                        ProducerEvent::ProfileDisabled(profile) => {
                            consumer.remove_profile(profile)
                        }
                    }
                }
                self.drain_consumer_events(now, consumer_id);
            }
        }
    }

    fn drain_consumer_events(&mut self, now: Instant, consumer_id: ConsumerId) {
        loop {
            let event = match self.consumers.get_mut(&consumer_id) {
                Some(consumer) => consumer.pop_event(),
                None => return,
            };
            let Some(event) = event else {
                return;
            };

            match event {
                ConsumerEvent::SourcePaused => {
                    self.notifications.push_back(Notification::new(
                        consumer_id.0,
                        "sourcepaused",
                        None,
                    ));
                }
                ConsumerEvent::SourceResumed => {
                    self.notifications.push_back(Notification::new(
                        consumer_id.0,
                        "sourceresumed",
                        None,
                    ));
                }
                ConsumerEvent::EffectiveProfileChange(profile) => {
                    self.notifications.push_back(Notification::new(
                        consumer_id.0,
                        "effectiveprofilechange",
                        Some(serde_json::json!({ "profile": profile })),
                    ));
                }
                ConsumerEvent::ParametersChange => {
                    self.notifications.push_back(Notification::new(
                        consumer_id.0,
                        "parameterschange",
                        None,
                    ));
                }
                ConsumerEvent::FullFrameRequired => {
                    let Some(consumer) = self.consumers.get(&consumer_id) else {
                        continue;
                    };
                    let producer_id = consumer.source_producer_id();
                    let profile = consumer.effective_profile();
                    if let Some(producer) = self.producers.get_mut(&producer_id) {
                        producer.request_key_frame(now, profile);
                    }
                }
            }
        }
    }

    /// Moves every entity's queued output into the router write queue,
    /// tagged with the owning transport.
    fn sweep(&mut self) {
        for producer in self.producers.values_mut() {
            let transport = producer.transport();
            while let Some(batch) = producer.pop_rtcp() {
                self.write_queue.push_back(TaggedPacket {
                    transport,
                    packet: Packet::Rtcp(batch),
                });
            }
        }
        for consumer in self.consumers.values_mut() {
            let Some(transport) = consumer.transport() else {
                continue;
            };
            while let Some(out) = consumer.pop_out() {
                let packet = match out {
                    ConsumerOut::Rtp(packet) => Packet::Rtp(packet),
                    ConsumerOut::Rtcp(batch) => Packet::Rtcp(batch),
                };
                self.write_queue.push_back(TaggedPacket { transport, packet });
            }
        }
    }
}
