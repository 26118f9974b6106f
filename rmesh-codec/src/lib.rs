#![deny(unsafe_code)]

//! MQTT 3.1 / 3.1.1 codec used by the rmesh listeners.
//!
//! Only the packets a QoS 0 broker exchanges with its clients are modelled:
//! CONNECT/CONNACK, PUBLISH/PUBACK, SUBSCRIBE/SUBACK, UNSUBSCRIBE/UNSUBACK,
//! PINGREQ/PINGRESP and DISCONNECT. [`MqttCodec`] plugs into
//! `tokio_util::codec::Framed`.
//!
//! ```
//! use bytes::BytesMut;
//! use rmesh_codec::{MqttCodec, Packet};
//! use tokio_util::codec::{Decoder, Encoder};
//!
//! let mut codec = MqttCodec::new(1024 * 1024);
//! let mut buf = BytesMut::new();
//! codec.encode(Packet::PingRequest, &mut buf).unwrap();
//! let (p, _) = codec.decode(&mut buf).unwrap().unwrap();
//! assert_eq!(p, Packet::PingRequest);
//! ```

mod codec;
pub mod error;
mod packet;
mod read;
mod wire;
mod write;

pub use self::codec::MqttCodec;
pub use self::packet::{
    Connect, ConnectAck, ConnectAckReason, LastWill, Packet, Protocol, Publish, QoS, SubscribeReturnCode,
    MQTT_LEVEL_31, MQTT_LEVEL_311,
};
