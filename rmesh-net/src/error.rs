use rmesh_codec::error::{DecodeError, EncodeError};

/// Transport level failures of a client connection.
#[derive(Debug, thiserror::Error)]
pub enum MqttError {
    #[error("cannot decode frame, {0}")]
    Decode(#[from] DecodeError),
    #[error("cannot encode packet, {0}")]
    Encode(#[from] EncodeError),
    #[error("no data before the read deadline")]
    ReadTimeout,
    #[error("write did not complete in time")]
    WriteTimeout,
    #[error("flush did not complete in time")]
    FlushTimeout,
    #[error("close did not complete in time")]
    CloseTimeout,
    #[error("client missed its keep alive")]
    KeepAliveTimeout,
    #[error("expected {0}")]
    UnexpectedPacket(&'static str),
    #[error("client went away")]
    Disconnected,
    #[error("listener cannot serve this connection")]
    ServiceUnavailable,
    #[error("acceptor used with the wrong listener type")]
    MismatchedListenerType,
}

impl MqttError {
    /// Timeouts and disconnects are part of normal client churn.
    #[inline]
    pub fn is_expected(&self) -> bool {
        matches!(self, MqttError::KeepAliveTimeout | MqttError::Disconnected | MqttError::ReadTimeout)
    }
}
