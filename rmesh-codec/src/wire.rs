use std::num::NonZeroU16;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use bytestring::ByteString;

use crate::error::{DecodeError, EncodeError};

/// Largest remaining length the four length bytes of a fixed header hold.
pub(crate) const MAX_REMAINING_LENGTH: u32 = 0x0FFF_FFFF;

/// Reads the body of one control packet.
pub(crate) struct Reader {
    buf: Bytes,
}

impl Reader {
    #[inline]
    pub(crate) fn new(buf: Bytes) -> Self {
        Reader { buf }
    }

    #[inline]
    pub(crate) fn is_empty(&self) -> bool {
        !self.buf.has_remaining()
    }

    #[inline]
    fn need(&self, n: usize) -> Result<(), DecodeError> {
        if self.buf.remaining() < n {
            return Err(DecodeError::InvalidLength);
        }
        Ok(())
    }

    pub(crate) fn u8(&mut self) -> Result<u8, DecodeError> {
        self.need(1)?;
        Ok(self.buf.get_u8())
    }

    pub(crate) fn u16(&mut self) -> Result<u16, DecodeError> {
        self.need(2)?;
        Ok(self.buf.get_u16())
    }

    pub(crate) fn packet_id(&mut self) -> Result<NonZeroU16, DecodeError> {
        NonZeroU16::new(self.u16()?).ok_or(DecodeError::MalformedPacket)
    }

    /// A field prefixed by its two byte length.
    pub(crate) fn bytes(&mut self) -> Result<Bytes, DecodeError> {
        let len = self.u16()? as usize;
        self.need(len)?;
        Ok(self.buf.split_to(len))
    }

    pub(crate) fn string(&mut self) -> Result<ByteString, DecodeError> {
        ByteString::try_from(self.bytes()?).map_err(|_| DecodeError::Utf8Error)
    }

    /// Everything left, the payload of a PUBLISH.
    #[inline]
    pub(crate) fn rest(&mut self) -> Bytes {
        self.buf.split_off(0)
    }

    pub(crate) fn finish(self) -> Result<(), DecodeError> {
        if self.is_empty() {
            Ok(())
        } else {
            Err(DecodeError::InvalidLength)
        }
    }
}

/// Size of a length-prefixed field.
#[inline]
pub(crate) fn field_len(field: &[u8]) -> usize {
    2 + field.len()
}

pub(crate) fn put_field(dst: &mut BytesMut, field: &[u8]) -> Result<(), EncodeError> {
    let len = u16::try_from(field.len()).map_err(|_| EncodeError::InvalidLength)?;
    dst.put_u16(len);
    dst.put_slice(field);
    Ok(())
}

/// Parses the remaining length following the first header byte, giving the
/// length and how many bytes encoded it; `None` until all of them arrived.
pub(crate) fn read_remaining_length(src: &[u8]) -> Result<Option<(u32, usize)>, DecodeError> {
    let mut len = 0u32;
    for (i, byte) in src.iter().enumerate() {
        if i == 4 {
            return Err(DecodeError::InvalidLength);
        }
        len |= u32::from(byte & 0x7F) << (7 * i);
        if byte & 0x80 == 0 {
            return Ok(Some((len, i + 1)));
        }
    }
    if src.len() >= 4 {
        return Err(DecodeError::InvalidLength);
    }
    Ok(None)
}

pub(crate) fn put_remaining_length(dst: &mut BytesMut, mut len: u32) -> Result<(), EncodeError> {
    if len > MAX_REMAINING_LENGTH {
        return Err(EncodeError::InvalidLength);
    }
    loop {
        let byte = (len & 0x7F) as u8;
        len >>= 7;
        if len == 0 {
            dst.put_u8(byte);
            return Ok(());
        }
        dst.put_u8(byte | 0x80);
    }
}
