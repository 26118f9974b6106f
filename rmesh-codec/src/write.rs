use bytes::{BufMut, BytesMut};

use crate::error::EncodeError;
use crate::packet::{kind, Connect, ConnectFlags, Packet, Publish, QoS};
use crate::wire::{field_len, put_field, put_remaining_length};

/// Writes `packet` with its fixed header.
pub(crate) fn write_packet(packet: &Packet, dst: &mut BytesMut) -> Result<(), EncodeError> {
    let len = body_len(packet);
    let len = u32::try_from(len).map_err(|_| EncodeError::InvalidLength)?;
    dst.reserve(len as usize + 5);
    dst.put_u8(first_byte(packet)?);
    put_remaining_length(dst, len)?;

    match packet {
        Packet::Connect(connect) => write_connect(connect, dst)?,
        Packet::ConnectAck(ack) => {
            dst.put_u8(u8::from(ack.session_present));
            dst.put_u8(ack.return_code.into());
        }
        Packet::Publish(publish) => {
            put_field(dst, publish.topic.as_bytes())?;
            if let Some(id) = publish.packet_id {
                dst.put_u16(id.get());
            }
            dst.put_slice(&publish.payload);
        }
        Packet::PublishAck { packet_id } | Packet::UnsubscribeAck { packet_id } => dst.put_u16(packet_id.get()),
        Packet::Subscribe { packet_id, topic_filters } => {
            dst.put_u16(packet_id.get());
            for (filter, qos) in topic_filters {
                put_field(dst, filter.as_bytes())?;
                dst.put_u8((*qos).into());
            }
        }
        Packet::SubscribeAck { packet_id, status } => {
            dst.put_u16(packet_id.get());
            dst.extend(status.iter().map(|code| u8::from(*code)));
        }
        Packet::Unsubscribe { packet_id, topic_filters } => {
            dst.put_u16(packet_id.get());
            for filter in topic_filters {
                put_field(dst, filter.as_bytes())?;
            }
        }
        Packet::PingRequest | Packet::PingResponse | Packet::Disconnect => {}
    }
    Ok(())
}

fn first_byte(packet: &Packet) -> Result<u8, EncodeError> {
    let (typ, flags) = match packet {
        Packet::Connect(_) => (kind::CONNECT, 0),
        Packet::ConnectAck(_) => (kind::CONNACK, 0),
        Packet::Publish(p) => (kind::PUBLISH, publish_flags(p)?),
        Packet::PublishAck { .. } => (kind::PUBACK, 0),
        Packet::Subscribe { .. } => (kind::SUBSCRIBE, 0x02),
        Packet::SubscribeAck { .. } => (kind::SUBACK, 0),
        Packet::Unsubscribe { .. } => (kind::UNSUBSCRIBE, 0x02),
        Packet::UnsubscribeAck { .. } => (kind::UNSUBACK, 0),
        Packet::PingRequest => (kind::PINGREQ, 0),
        Packet::PingResponse => (kind::PINGRESP, 0),
        Packet::Disconnect => (kind::DISCONNECT, 0),
    };
    Ok(typ << 4 | flags)
}

fn publish_flags(p: &Publish) -> Result<u8, EncodeError> {
    if (p.qos == QoS::AtMostOnce) != p.packet_id.is_none() {
        return Err(EncodeError::PacketIdMismatch);
    }
    Ok(u8::from(p.dup) << 3 | u8::from(p.qos) << 1 | u8::from(p.retain))
}

fn body_len(packet: &Packet) -> usize {
    match packet {
        Packet::Connect(c) => {
            //name, level, flags and keep alive
            let mut n = field_len(c.protocol.name().as_bytes()) + 4 + field_len(c.client_id.as_bytes());
            if let Some(will) = &c.last_will {
                n += field_len(will.topic.as_bytes()) + field_len(&will.message);
            }
            n += c.username.as_ref().map_or(0, |u| field_len(u.as_bytes()));
            n + c.password.as_ref().map_or(0, |p| field_len(p))
        }
        Packet::Publish(p) => field_len(p.topic.as_bytes()) + p.packet_id.map_or(0, |_| 2) + p.payload.len(),
        Packet::ConnectAck(_) | Packet::PublishAck { .. } | Packet::UnsubscribeAck { .. } => 2,
        Packet::Subscribe { topic_filters, .. } => {
            2 + topic_filters.iter().map(|(f, _)| field_len(f.as_bytes()) + 1).sum::<usize>()
        }
        Packet::SubscribeAck { status, .. } => 2 + status.len(),
        Packet::Unsubscribe { topic_filters, .. } => {
            2 + topic_filters.iter().map(|f| field_len(f.as_bytes())).sum::<usize>()
        }
        Packet::PingRequest | Packet::PingResponse | Packet::Disconnect => 0,
    }
}

fn write_connect(c: &Connect, dst: &mut BytesMut) -> Result<(), EncodeError> {
    let mut flags = ConnectFlags::empty();
    flags.set(ConnectFlags::CLEAN_SESSION, c.clean_session);
    flags.set(ConnectFlags::USERNAME, c.username.is_some());
    flags.set(ConnectFlags::PASSWORD, c.password.is_some());
    if let Some(will) = &c.last_will {
        flags |= ConnectFlags::WILL;
        flags.set(ConnectFlags::WILL_RETAIN, will.retain);
        flags |= ConnectFlags::from_bits_truncate(u8::from(will.qos) << 3);
    }

    put_field(dst, c.protocol.name().as_bytes())?;
    dst.put_u8(c.protocol.level());
    dst.put_u8(flags.bits());
    dst.put_u16(c.keep_alive);
    put_field(dst, c.client_id.as_bytes())?;
    if let Some(will) = &c.last_will {
        put_field(dst, will.topic.as_bytes())?;
        put_field(dst, &will.message)?;
    }
    if let Some(username) = &c.username {
        put_field(dst, username.as_bytes())?;
    }
    if let Some(password) = &c.password {
        put_field(dst, password)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::num::NonZeroU16;

    use bytes::Bytes;
    use bytestring::ByteString;

    use super::*;
    use crate::packet::{ConnectAck, ConnectAckReason, LastWill, Protocol, SubscribeReturnCode, MQTT_LEVEL_311};
    use crate::read::read_packet;
    use crate::wire::read_remaining_length;

    fn written(packet: &Packet) -> BytesMut {
        let mut dst = BytesMut::new();
        write_packet(packet, &mut dst).unwrap();
        dst
    }

    fn id(v: u16) -> NonZeroU16 {
        NonZeroU16::new(v).unwrap()
    }

    #[test]
    fn fixed_headers() {
        assert_eq!(&written(&Packet::PingRequest)[..], b"\xc0\x00");
        assert_eq!(&written(&Packet::PingResponse)[..], b"\xd0\x00");
        assert_eq!(&written(&Packet::Disconnect)[..], b"\xe0\x00");
        assert_eq!(&written(&Packet::PublishAck { packet_id: id(0x4321) })[..], b"\x40\x02\x43\x21");
        assert_eq!(&written(&Packet::UnsubscribeAck { packet_id: id(0x4321) })[..], b"\xb0\x02\x43\x21");
        let ack = ConnectAck { session_present: false, return_code: ConnectAckReason::ConnectionAccepted };
        assert_eq!(&written(&Packet::ConnectAck(ack))[..], b"\x20\x02\x00\x00");
    }

    #[test]
    fn connect() {
        let connect = Connect {
            protocol: Protocol(MQTT_LEVEL_311),
            clean_session: false,
            keep_alive: 60,
            client_id: ByteString::from_static("dev-1"),
            last_will: None,
            username: Some(ByteString::from_static("user")),
            password: Some(Bytes::from_static(b"pass")),
        };
        assert_eq!(
            &written(&connect.clone().into())[..],
            b"\x10\x1D\x00\x04MQTT\x04\xC0\x00\x3C\x00\x05dev-1\x00\x04user\x00\x04pass"
        );

        //what is written reads back the same, will included
        let with_will = Connect {
            clean_session: true,
            last_will: Some(LastWill {
                qos: QoS::ExactlyOnce,
                retain: false,
                topic: ByteString::from_static("gone/"),
                message: Bytes::from_static(b"bye"),
            }),
            ..connect
        };
        let packet = Packet::from(with_will);
        let buf = written(&packet);
        let (len, n) = read_remaining_length(&buf[1..]).unwrap().unwrap();
        assert_eq!(len as usize, buf.len() - 1 - n);
        assert_eq!(read_packet(buf[0], buf.freeze().slice(1 + n..)).unwrap(), packet);
    }

    #[test]
    fn publish() {
        let p = Publish::at_most_once(ByteString::from_static("topic"), Bytes::from_static(b"data"));
        assert_eq!(&written(&p.clone().into())[..], b"\x30\x0b\x00\x05topicdata");

        let p1 = Publish { dup: true, retain: true, qos: QoS::AtLeastOnce, packet_id: Some(id(0x4321)), ..p.clone() };
        assert_eq!(&written(&p1.into())[..], b"\x3b\x0d\x00\x05topic\x43\x21data");

        let mut dst = BytesMut::new();
        let no_id = Publish { qos: QoS::AtLeastOnce, ..p.clone() };
        assert!(matches!(write_packet(&no_id.into(), &mut dst), Err(EncodeError::PacketIdMismatch)));
        let stray_id = Publish { packet_id: Some(id(1)), ..p };
        assert!(matches!(write_packet(&stray_id.into(), &mut dst), Err(EncodeError::PacketIdMismatch)));
        assert!(dst.is_empty());
    }

    #[test]
    fn subscriptions() {
        let sub = Packet::Subscribe {
            packet_id: id(0x1234),
            topic_filters: vec![
                (ByteString::from_static("test"), QoS::AtLeastOnce),
                (ByteString::from_static("filter"), QoS::ExactlyOnce),
            ],
        };
        assert_eq!(&written(&sub)[..], b"\x82\x12\x12\x34\x00\x04test\x01\x00\x06filter\x02");

        let ack = Packet::SubscribeAck {
            packet_id: id(0x1234),
            status: vec![SubscribeReturnCode::Success(QoS::AtLeastOnce), SubscribeReturnCode::Failure],
        };
        assert_eq!(&written(&ack)[..], b"\x90\x04\x12\x34\x01\x80");

        let unsub = Packet::Unsubscribe {
            packet_id: id(0x1234),
            topic_filters: vec![ByteString::from_static("test"), ByteString::from_static("filter")],
        };
        assert_eq!(&written(&unsub)[..], b"\xa2\x10\x12\x34\x00\x04test\x00\x06filter");
    }
}
