use bytes::{Buf, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::error::{DecodeError, EncodeError};
use crate::packet::Packet;
use crate::read::read_packet;
use crate::wire::read_remaining_length;
use crate::write::write_packet;

/// Framing codec for MQTT 3.1 / 3.1.1.
///
/// Decoded items carry the remaining length of the frame next to the packet.
#[derive(Debug, Clone)]
pub struct MqttCodec {
    max_size: u32,
    //first byte and remaining length of a header whose body is still arriving
    pending: Option<(u8, u32)>,
}

impl MqttCodec {
    /// A `max_packet_size` of `0` means unlimited.
    pub fn new(max_packet_size: u32) -> Self {
        MqttCodec { max_size: max_packet_size, pending: None }
    }

    fn read_header(&self, src: &mut BytesMut) -> Result<Option<(u8, u32)>, DecodeError> {
        let Some(&first) = src.first() else {
            return Ok(None);
        };
        let Some((len, n)) = read_remaining_length(&src[1..])? else {
            return Ok(None);
        };
        if self.max_size != 0 && len > self.max_size {
            return Err(DecodeError::MaxSizeExceeded(len));
        }
        src.advance(1 + n);
        Ok(Some((first, len)))
    }
}

impl Default for MqttCodec {
    fn default() -> Self {
        Self::new(0)
    }
}

impl Decoder for MqttCodec {
    type Item = (Packet, u32);
    type Error = DecodeError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, DecodeError> {
        let (first, len) = match self.pending.take() {
            Some(header) => header,
            None => match self.read_header(src)? {
                Some(header) => header,
                None => return Ok(None),
            },
        };
        if src.len() < len as usize {
            src.reserve(len as usize - src.len());
            self.pending = Some((first, len));
            return Ok(None);
        }
        let body = src.split_to(len as usize).freeze();
        Ok(Some((read_packet(first, body)?, len)))
    }
}

impl Encoder<Packet> for MqttCodec {
    type Error = EncodeError;

    fn encode(&mut self, item: Packet, dst: &mut BytesMut) -> Result<(), EncodeError> {
        write_packet(&item, dst)
    }
}
