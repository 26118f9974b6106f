use std::fmt;
use std::num::NonZeroU16;

use bytes::Bytes;
use bytestring::ByteString;

use crate::error::DecodeError;

pub const MQTT_LEVEL_31: u8 = 3;
pub const MQTT_LEVEL_311: u8 = 4;

/// High nibble of the first header byte.
pub(crate) mod kind {
    pub const CONNECT: u8 = 1;
    pub const CONNACK: u8 = 2;
    pub const PUBLISH: u8 = 3;
    pub const PUBACK: u8 = 4;
    pub const SUBSCRIBE: u8 = 8;
    pub const SUBACK: u8 = 9;
    pub const UNSUBSCRIBE: u8 = 10;
    pub const UNSUBACK: u8 = 11;
    pub const PINGREQ: u8 = 12;
    pub const PINGRESP: u8 = 13;
    pub const DISCONNECT: u8 = 14;
}

bitflags::bitflags! {
    /// Flags byte of a CONNECT variable header, bit 0 is reserved.
    #[derive(Copy, Clone, Debug, PartialEq, Eq)]
    pub(crate) struct ConnectFlags: u8 {
        const USERNAME = 0x80;
        const PASSWORD = 0x40;
        const WILL_RETAIN = 0x20;
        const WILL_QOS = 0x18;
        const WILL = 0x04;
        const CLEAN_SESSION = 0x02;
    }
}

/// Protocol level announced in CONNECT.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Protocol(pub u8);

impl Protocol {
    #[inline]
    pub fn name(self) -> &'static str {
        if self.0 == MQTT_LEVEL_31 {
            "MQIsdp"
        } else {
            "MQTT"
        }
    }

    #[inline]
    pub fn level(self) -> u8 {
        self.0
    }
}

impl Default for Protocol {
    fn default() -> Self {
        Protocol(MQTT_LEVEL_311)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum QoS {
    AtMostOnce,
    AtLeastOnce,
    ExactlyOnce,
}

impl TryFrom<u8> for QoS {
    type Error = DecodeError;

    fn try_from(v: u8) -> Result<Self, DecodeError> {
        match v {
            0 => Ok(QoS::AtMostOnce),
            1 => Ok(QoS::AtLeastOnce),
            2 => Ok(QoS::ExactlyOnce),
            _ => Err(DecodeError::MalformedPacket),
        }
    }
}

impl From<QoS> for u8 {
    fn from(qos: QoS) -> u8 {
        qos as u8
    }
}

/// CONNACK return codes of MQTT 3.1.1.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectAckReason {
    ConnectionAccepted,
    UnacceptableProtocolVersion,
    IdentifierRejected,
    ServiceUnavailable,
    BadUserNameOrPassword,
    NotAuthorized,
}

impl ConnectAckReason {
    pub fn reason(self) -> &'static str {
        match self {
            ConnectAckReason::ConnectionAccepted => "accepted",
            ConnectAckReason::UnacceptableProtocolVersion => "refused, unacceptable protocol version",
            ConnectAckReason::IdentifierRejected => "refused, client id rejected",
            ConnectAckReason::ServiceUnavailable => "refused, broker unavailable",
            ConnectAckReason::BadUserNameOrPassword => "refused, bad user name or password",
            ConnectAckReason::NotAuthorized => "refused, not authorized",
        }
    }
}

impl TryFrom<u8> for ConnectAckReason {
    type Error = DecodeError;

    fn try_from(v: u8) -> Result<Self, DecodeError> {
        Ok(match v {
            0 => ConnectAckReason::ConnectionAccepted,
            1 => ConnectAckReason::UnacceptableProtocolVersion,
            2 => ConnectAckReason::IdentifierRejected,
            3 => ConnectAckReason::ServiceUnavailable,
            4 => ConnectAckReason::BadUserNameOrPassword,
            5 => ConnectAckReason::NotAuthorized,
            _ => return Err(DecodeError::MalformedPacket),
        })
    }
}

impl From<ConnectAckReason> for u8 {
    fn from(r: ConnectAckReason) -> u8 {
        r as u8
    }
}

/// Connection Will. Parsed so the CONNECT frame is consumed, never published.
#[derive(Debug, PartialEq, Eq, Clone)]
pub struct LastWill {
    pub qos: QoS,
    pub retain: bool,
    pub topic: ByteString,
    pub message: Bytes,
}

#[derive(Default, Debug, PartialEq, Eq, Clone)]
pub struct Connect {
    pub protocol: Protocol,
    pub clean_session: bool,
    /// keep alive interval in seconds, 0 disables it
    pub keep_alive: u16,
    pub last_will: Option<LastWill>,
    pub client_id: ByteString,
    pub username: Option<ByteString>,
    pub password: Option<Bytes>,
}

#[derive(Debug, PartialEq, Eq, Copy, Clone)]
pub struct ConnectAck {
    pub return_code: ConnectAckReason,
    pub session_present: bool,
}

#[derive(PartialEq, Eq, Clone)]
pub struct Publish {
    pub dup: bool,
    pub retain: bool,
    pub qos: QoS,
    /// the channel string, key included
    pub topic: ByteString,
    /// present only when qos > 0
    pub packet_id: Option<NonZeroU16>,
    pub payload: Bytes,
}

impl Publish {
    /// A fire-and-forget publish, the only kind the broker sends.
    pub fn at_most_once(topic: ByteString, payload: Bytes) -> Self {
        Publish { dup: false, retain: false, qos: QoS::AtMostOnce, topic, packet_id: None, payload }
    }
}

impl fmt::Debug for Publish {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Publish({:?}, {:?}, {:?}, {} bytes)", self.topic, self.qos, self.packet_id, self.payload.len())
    }
}

#[derive(Debug, PartialEq, Eq, Copy, Clone)]
pub enum SubscribeReturnCode {
    Success(QoS),
    Failure,
}

impl SubscribeReturnCode {
    const FAILURE: u8 = 0x80;
}

impl From<SubscribeReturnCode> for u8 {
    fn from(code: SubscribeReturnCode) -> u8 {
        match code {
            SubscribeReturnCode::Success(qos) => qos.into(),
            SubscribeReturnCode::Failure => SubscribeReturnCode::FAILURE,
        }
    }
}

impl TryFrom<u8> for SubscribeReturnCode {
    type Error = DecodeError;

    fn try_from(v: u8) -> Result<Self, DecodeError> {
        if v == SubscribeReturnCode::FAILURE {
            Ok(SubscribeReturnCode::Failure)
        } else {
            QoS::try_from(v).map(SubscribeReturnCode::Success)
        }
    }
}

/// The control packets a QoS 0 broker exchanges with its clients.
#[derive(Debug, PartialEq, Eq, Clone)]
pub enum Packet {
    Connect(Box<Connect>),
    ConnectAck(ConnectAck),
    Publish(Publish),
    PublishAck { packet_id: NonZeroU16 },
    Subscribe { packet_id: NonZeroU16, topic_filters: Vec<(ByteString, QoS)> },
    SubscribeAck { packet_id: NonZeroU16, status: Vec<SubscribeReturnCode> },
    Unsubscribe { packet_id: NonZeroU16, topic_filters: Vec<ByteString> },
    UnsubscribeAck { packet_id: NonZeroU16 },
    PingRequest,
    PingResponse,
    Disconnect,
}

impl From<Connect> for Packet {
    fn from(val: Connect) -> Packet {
        Packet::Connect(Box::new(val))
    }
}

impl From<Publish> for Packet {
    fn from(val: Publish) -> Packet {
        Packet::Publish(val)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes() {
        assert_eq!(QoS::try_from(1u8).unwrap(), QoS::AtLeastOnce);
        assert!(QoS::try_from(3u8).is_err());
        assert_eq!(u8::from(QoS::ExactlyOnce), 2);
        assert_eq!(u8::from(ConnectAckReason::NotAuthorized), 5);
        assert_eq!(ConnectAckReason::try_from(2u8).unwrap(), ConnectAckReason::IdentifierRejected);
        assert!(ConnectAckReason::try_from(6u8).is_err());
        assert_eq!(u8::from(SubscribeReturnCode::Failure), 0x80);
        assert_eq!(SubscribeReturnCode::try_from(1u8).unwrap(), SubscribeReturnCode::Success(QoS::AtLeastOnce));
        assert_eq!(Protocol(MQTT_LEVEL_31).name(), "MQIsdp");
        assert_eq!(Protocol::default().name(), "MQTT");
    }
}
