use bytes::Bytes;
use serde_json::json;

/// A failed client request, reported back to the client with an HTTP-like
/// status code while the connection stays open.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum EventError {
    #[error("the request was invalid or cannot be otherwise served")]
    BadRequest,
    #[error("the security key provided is not authorized to perform this operation")]
    Unauthorized,
    #[error("the request can not be served, as the payment is required to proceed")]
    PaymentRequired,
    #[error("the request is understood but it has been refused or access is not allowed")]
    Forbidden,
    #[error("the resource requested does not exist")]
    NotFound,
    #[error("an unexpected condition was encountered and no more specific message is suitable")]
    ServerError,
    #[error("the server either does not recognize the request method, or it lacks the ability to fulfill the request")]
    NotImplemented,
}

impl EventError {
    #[inline]
    pub fn status(&self) -> u16 {
        match self {
            EventError::BadRequest => 400,
            EventError::Unauthorized => 401,
            EventError::PaymentRequired => 402,
            EventError::Forbidden => 403,
            EventError::NotFound => 404,
            EventError::ServerError => 500,
            EventError::NotImplemented => 501,
        }
    }

    /// `{"status": <code>, "message": <text>}`
    pub fn to_payload(&self) -> Bytes {
        Bytes::from(json!({ "status": self.status(), "message": self.to_string() }).to_string())
    }
}
