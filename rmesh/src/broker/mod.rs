//! Client-facing broker: channel authorization, publish and subscribe
//! handling, and the per-connection protocol loop.

pub mod conn;
pub mod error;
pub mod keygen;
mod service;
mod subscriber;

pub use error::EventError;
pub use keygen::{KeyGenRequest, KeyGenResponse};
pub use subscriber::{ConnHandle, Subscriber, SubscriberKind, TransportError};

/// Channel every failed request is answered on.
pub const ERROR_CHANNEL: &str = "emitter/error/";
/// Channel key reserved for requests to the broker itself.
pub const SERVICE_KEY: &str = "emitter";
