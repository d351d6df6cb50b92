//! Control-plane request/notification channel with the host process.
//!
//! Requests are `{id, method, internal, data}` objects; `internal` locates
//! the target entity and `data` carries parameters. Responses are
//! `{id, accepted: true, data?}` or `{id, rejected: true, reason}`.
//! Notifications are unsolicited `{targetId, event, data?}` objects. The
//! framing lives in `sfu_shared::framing`; this module is I/O-free.

use crate::parameters::{ConsumerId, MediaKind, ProducerId, Profile, RouterId, TransportId};
use crate::router::{Router, TaggedPacket};
use serde::{Deserialize, Serialize};
use sfu_shared::{Error, Result};
use std::collections::{HashMap, VecDeque};
use std::time::Instant;

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Internal {
    pub router_id: Option<RouterId>,
    pub producer_id: Option<ProducerId>,
    pub consumer_id: Option<ConsumerId>,
    pub transport_id: Option<TransportId>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Request {
    pub id: u32,
    pub method: String,
    #[serde(default)]
    pub internal: Internal,
    #[serde(default)]
    pub data: serde_json::Value,
}

#[derive(Debug, Serialize)]
#[serde(untagged)]
pub enum Response {
    Accepted {
        id: u32,
        accepted: bool,
        #[serde(skip_serializing_if = "Option::is_none")]
        data: Option<serde_json::Value>,
    },
    Rejected {
        id: u32,
        rejected: bool,
        reason: String,
    },
}

impl Response {
    pub fn accept(id: u32, data: Option<serde_json::Value>) -> Self {
        Response::Accepted {
            id,
            accepted: true,
            data,
        }
    }

    pub fn reject(id: u32, reason: &Error) -> Self {
        Response::Rejected {
            id,
            rejected: true,
            reason: reason.to_string(),
        }
    }
}

/// An unsolicited event toward the host process.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Notification {
    pub target_id: u32,
    pub event: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
}

impl Notification {
    pub fn new(target_id: u32, event: &str, data: Option<serde_json::Value>) -> Self {
        Self {
            target_id,
            event: event.to_string(),
            data,
        }
    }
}

/// The worker-level entity table: routers by id, with the request dispatch
/// for every recognised method.
#[derive(Default)]
pub struct Worker {
    routers: HashMap<RouterId, Router>,
    notifications: VecDeque<Notification>,
}

impl Worker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn router_mut(&mut self, id: RouterId) -> Option<&mut Router> {
        self.routers.get_mut(&id)
    }

    pub fn handle_request(&mut self, now: Instant, request: &Request) -> Response {
        match self.dispatch(now, request) {
            Ok(data) => Response::accept(request.id, data),
            Err(error) => Response::reject(request.id, &error),
        }
    }

    pub fn handle_timeout(&mut self, now: Instant) {
        for router in self.routers.values_mut() {
            router.handle_timeout(now);
        }
    }

    pub fn poll_timeout(&self) -> Option<Instant> {
        self.routers.values().map(|r| r.poll_timeout()).min()
    }

    pub fn poll_write(&mut self) -> Option<TaggedPacket> {
        for router in self.routers.values_mut() {
            if let Some(packet) = router.poll_write() {
                return Some(packet);
            }
        }
        None
    }

    pub fn poll_event(&mut self) -> Option<Notification> {
        if let Some(notification) = self.notifications.pop_front() {
            return Some(notification);
        }
        for router in self.routers.values_mut() {
            if let Some(notification) = router.poll_event() {
                return Some(notification);
            }
        }
        None
    }

    fn dispatch(&mut self, now: Instant, request: &Request) -> Result<Option<serde_json::Value>> {
        match request.method.as_str() {
            "worker.dump" => {
                let mut router_ids: Vec<u32> =
                    self.routers.keys().map(|r| r.0).collect();
                router_ids.sort_unstable();
                Ok(Some(serde_json::json!({ "routerIds": router_ids })))
            }

            "worker.createRouter" => {
                let router_id = self.router_id(request)?;
                if self.routers.contains_key(&router_id) {
                    return Err(Error::ErrDuplicatedId);
                }
                self.routers.insert(router_id, Router::new(router_id));
                Ok(None)
            }

            "router.close" => {
                let router_id = self.router_id(request)?;
                let Some(mut router) = self.routers.remove(&router_id) else {
                    return Err(Error::ErrRouterNotFound);
                };
                router.close();
                while let Some(notification) = router.poll_event() {
                    self.notifications.push_back(notification);
                }
                self.notifications
                    .push_back(Notification::new(router_id.0, "close", None));
                Ok(None)
            }

            "router.dump" => {
                let router = self.router(request)?;
                Ok(Some(router.dump()))
            }

            "router.createProducer" => {
                let producer_id = Self::required(request.internal.producer_id, "producerId")?;
                let transport_id = Self::required(request.internal.transport_id, "transportId")?;
                let kind: MediaKind = Self::data_field(request, "kind")?;
                let rtp_parameters = Self::data_field(request, "rtpParameters")?;
                let paused = request.data["paused"].as_bool().unwrap_or(false);

                let router = self.router_for_mut(request)?;
                router.create_producer(producer_id, kind, transport_id, rtp_parameters, paused)?;
                Ok(None)
            }

            "router.createConsumer" => {
                let consumer_id = Self::required(request.internal.consumer_id, "consumerId")?;
                let producer_id = Self::required(request.internal.producer_id, "producerId")?;

                let router = self.router_for_mut(request)?;
                router.create_consumer(now, consumer_id, producer_id)?;
                Ok(None)
            }

            "producer.close" => {
                let producer_id = Self::required(request.internal.producer_id, "producerId")?;
                let router = self.router_for_mut(request)?;
                router.close_producer(producer_id)?;
                Ok(None)
            }

            "producer.pause" => {
                let producer_id = Self::required(request.internal.producer_id, "producerId")?;
                let router = self.router_for_mut(request)?;
                router.pause_producer(now, producer_id)?;
                Ok(None)
            }

            "producer.resume" => {
                let producer_id = Self::required(request.internal.producer_id, "producerId")?;
                let router = self.router_for_mut(request)?;
                router.resume_producer(now, producer_id)?;
                Ok(None)
            }

            "producer.updateRtpParameters" => {
                let producer_id = Self::required(request.internal.producer_id, "producerId")?;
                let rtp_parameters = Self::data_field(request, "rtpParameters")?;
                let router = self.router_for_mut(request)?;
                router.update_producer_parameters(now, producer_id, rtp_parameters)?;
                Ok(None)
            }

            "producer.dump" => {
                let producer_id = Self::required(request.internal.producer_id, "producerId")?;
                let router = self.router_for_mut(request)?;
                Ok(Some(router.dump_producer(now, producer_id)?))
            }

            "consumer.close" => {
                let consumer_id = Self::required(request.internal.consumer_id, "consumerId")?;
                let router = self.router_for_mut(request)?;
                router.close_consumer(consumer_id)?;
                Ok(None)
            }

            "consumer.enable" => {
                let consumer_id = Self::required(request.internal.consumer_id, "consumerId")?;
                let transport_id = Self::required(request.internal.transport_id, "transportId")?;
                let rtp_parameters = Self::data_field(request, "rtpParameters")?;

                let router = self.router_for_mut(request)?;
                router.enable_consumer(now, consumer_id, transport_id, rtp_parameters)?;
                Ok(None)
            }

            "consumer.disable" => {
                let consumer_id = Self::required(request.internal.consumer_id, "consumerId")?;
                let router = self.router_for_mut(request)?;
                router.disable_consumer(now, consumer_id)?;
                Ok(None)
            }

            "consumer.pause" => {
                let consumer_id = Self::required(request.internal.consumer_id, "consumerId")?;
                let router = self.router_for_mut(request)?;
                router.pause_consumer(now, consumer_id)?;
                Ok(None)
            }

            "consumer.resume" => {
                let consumer_id = Self::required(request.internal.consumer_id, "consumerId")?;
                let router = self.router_for_mut(request)?;
                router.resume_consumer(now, consumer_id)?;
                Ok(None)
            }

            "consumer.setPreferredProfile" => {
                let consumer_id = Self::required(request.internal.consumer_id, "consumerId")?;
                let profile: Profile = Self::data_field(request, "profile")?;
                let router = self.router_for_mut(request)?;
                router.set_consumer_preferred_profile(now, consumer_id, profile)?;
                Ok(None)
            }

            "consumer.requestFullFrame" => {
                let consumer_id = Self::required(request.internal.consumer_id, "consumerId")?;
                let router = self.router_for_mut(request)?;
                router.request_consumer_full_frame(now, consumer_id)?;
                Ok(None)
            }

            "consumer.dump" => {
                let consumer_id = Self::required(request.internal.consumer_id, "consumerId")?;
                let router = self.router_for_mut(request)?;
                Ok(Some(router.dump_consumer(now, consumer_id)?))
            }

            _ => Err(Error::ErrUnknownMethod),
        }
    }

    fn router_id(&self, request: &Request) -> Result<RouterId> {
        Self::required(request.internal.router_id, "routerId")
    }

    fn router(&mut self, request: &Request) -> Result<&Router> {
        let router_id = self.router_id(request)?;
        self.routers
            .get(&router_id)
            .ok_or(Error::ErrRouterNotFound)
    }

    fn router_for_mut(&mut self, request: &Request) -> Result<&mut Router> {
        let router_id = Self::required(request.internal.router_id, "routerId")?;
        self.routers
            .get_mut(&router_id)
            .ok_or(Error::ErrRouterNotFound)
    }

    fn required<T>(value: Option<T>, field: &'static str) -> Result<T> {
        value.ok_or(Error::ErrMissingInternalField(field))
    }

    fn data_field<T: serde::de::DeserializeOwned>(
        request: &Request,
        field: &'static str,
    ) -> Result<T> {
        let value = request
            .data
            .get(field)
            .ok_or(Error::ErrMissingDataField(field))?;
        serde_json::from_value(value.clone())
            .map_err(|e| Error::ErrInvalidRequest(format!("{field}: {e}")))
    }
}
