use std::io;

/// Why an incoming frame was refused.
#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    #[error("protocol name is neither MQTT nor MQIsdp")]
    InvalidProtocol,
    #[error("protocol level {0} is not supported")]
    UnsupportedProtocolLevel(u8),
    #[error("length field out of range")]
    InvalidLength,
    #[error("malformed packet")]
    MalformedPacket,
    #[error("reserved flag bits are set")]
    ReservedFlags,
    #[error("empty client id without a clean session")]
    InvalidClientId,
    #[error("packet type {0:#04x} is not handled")]
    UnsupportedPacketType(u8),
    #[error("remaining length {0} exceeds the packet size limit")]
    MaxSizeExceeded(u32),
    #[error("string field is not utf-8")]
    Utf8Error,
    #[error("io error, {0:?}")]
    Io(#[from] io::Error),
}

/// Why an outgoing packet could not be written.
#[derive(Debug, thiserror::Error)]
pub enum EncodeError {
    #[error("field or packet too long")]
    InvalidLength,
    #[error("packet id and QoS disagree")]
    PacketIdMismatch,
    #[error("io error, {0:?}")]
    Io(#[from] io::Error),
}
