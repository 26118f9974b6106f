use bytes::Bytes;

use crate::error::DecodeError;
use crate::packet::{
    kind, Connect, ConnectAck, ConnectFlags, LastWill, Packet, Protocol, Publish, QoS, MQTT_LEVEL_31, MQTT_LEVEL_311,
};
use crate::wire::Reader;

/// Decodes the body of a packet whose fixed header started with `first`.
pub(crate) fn read_packet(first: u8, body: Bytes) -> Result<Packet, DecodeError> {
    let (typ, flags) = (first >> 4, first & 0x0F);
    let mut r = Reader::new(body);
    if typ == kind::PUBLISH {
        return read_publish(&mut r, flags);
    }

    let expected_flags = if typ == kind::SUBSCRIBE || typ == kind::UNSUBSCRIBE { 0x02 } else { 0 };
    let packet = match typ {
        kind::CONNECT => read_connect(&mut r)?,
        kind::CONNACK => {
            let session = r.u8()?;
            if session > 1 {
                return Err(DecodeError::ReservedFlags);
            }
            Packet::ConnectAck(ConnectAck { session_present: session == 1, return_code: r.u8()?.try_into()? })
        }
        kind::PUBACK => Packet::PublishAck { packet_id: r.packet_id()? },
        kind::SUBSCRIBE => {
            let packet_id = r.packet_id()?;
            let mut topic_filters = Vec::new();
            while !r.is_empty() {
                let filter = r.string()?;
                topic_filters.push((filter, QoS::try_from(r.u8()? & 0x03)?));
            }
            if topic_filters.is_empty() {
                return Err(DecodeError::MalformedPacket);
            }
            Packet::Subscribe { packet_id, topic_filters }
        }
        kind::SUBACK => {
            let packet_id = r.packet_id()?;
            let mut status = Vec::new();
            while !r.is_empty() {
                status.push(r.u8()?.try_into()?);
            }
            Packet::SubscribeAck { packet_id, status }
        }
        kind::UNSUBSCRIBE => {
            let packet_id = r.packet_id()?;
            let mut topic_filters = Vec::new();
            while !r.is_empty() {
                topic_filters.push(r.string()?);
            }
            Packet::Unsubscribe { packet_id, topic_filters }
        }
        kind::UNSUBACK => Packet::UnsubscribeAck { packet_id: r.packet_id()? },
        kind::PINGREQ => Packet::PingRequest,
        kind::PINGRESP => Packet::PingResponse,
        kind::DISCONNECT => Packet::Disconnect,
        _ => return Err(DecodeError::UnsupportedPacketType(first)),
    };
    if flags != expected_flags {
        return Err(DecodeError::ReservedFlags);
    }
    r.finish()?;
    Ok(packet)
}

fn read_publish(r: &mut Reader, flags: u8) -> Result<Packet, DecodeError> {
    let topic = r.string()?;
    let qos = QoS::try_from((flags >> 1) & 0x03)?;
    let packet_id = match qos {
        QoS::AtMostOnce => None,
        _ => Some(r.packet_id()?),
    };
    Ok(Packet::Publish(Publish {
        dup: flags & 0x08 != 0,
        retain: flags & 0x01 != 0,
        qos,
        topic,
        packet_id,
        payload: r.rest(),
    }))
}

fn read_connect(r: &mut Reader) -> Result<Packet, DecodeError> {
    let name = r.bytes()?;
    if name != b"MQTT"[..] && name != b"MQIsdp"[..] {
        return Err(DecodeError::InvalidProtocol);
    }
    let level = r.u8()?;
    if level != MQTT_LEVEL_311 && level != MQTT_LEVEL_31 {
        return Err(DecodeError::UnsupportedProtocolLevel(level));
    }
    let flags = ConnectFlags::from_bits(r.u8()?).ok_or(DecodeError::ReservedFlags)?;
    let clean_session = flags.contains(ConnectFlags::CLEAN_SESSION);
    let keep_alive = r.u16()?;

    let client_id = r.string()?;
    if client_id.is_empty() && !clean_session {
        return Err(DecodeError::InvalidClientId);
    }
    let last_will = if flags.contains(ConnectFlags::WILL) {
        Some(LastWill {
            qos: QoS::try_from((flags & ConnectFlags::WILL_QOS).bits() >> 3)?,
            retain: flags.contains(ConnectFlags::WILL_RETAIN),
            topic: r.string()?,
            message: r.bytes()?,
        })
    } else {
        None
    };
    let username = flags.contains(ConnectFlags::USERNAME).then(|| r.string()).transpose()?;
    let password = flags.contains(ConnectFlags::PASSWORD).then(|| r.bytes()).transpose()?;

    let protocol = Protocol(level);
    Ok(Connect { protocol, clean_session, keep_alive, last_will, client_id, username, password }.into())
}
