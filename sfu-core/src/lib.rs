#![warn(rust_2018_idioms)]
#![allow(dead_code)]

pub mod channel;
pub mod codecs;
pub mod consumer;
pub mod packet;
pub mod parameters;
pub mod producer;
pub mod router;
pub mod sequence;
pub mod stream;

pub use channel::{Notification, Request, Response, Worker};
pub use consumer::Consumer;
pub use packet::MediaPacket;
pub use parameters::{MediaKind, Profile, RtpParameters};
pub use producer::Producer;
pub use router::{Packet, Router, TaggedPacket};
