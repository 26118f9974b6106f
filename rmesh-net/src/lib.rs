#![deny(unsafe_code)]

//! Listeners and framed client streams for the rmesh broker.
//!
//! ```rust,no_run
//! use rmesh_net::{Builder, Result};
//!
//! # async fn run() -> Result<()> {
//! let l = Builder::new().name("external/tcp").laddr(([0, 0, 0, 0], 1883).into()).bind()?.tcp()?;
//! let acceptor = l.accept().await?;
//! let mut stream = acceptor.tcp()?.mqtt();
//! let connect = stream.recv_connect(l.cfg.handshake_timeout).await?;
//! # Ok(())
//! # }
//! ```

mod error;
mod listener;
mod stream;
#[cfg(feature = "ws")]
mod ws;

pub use error::MqttError;
pub use listener::{Acceptor, Builder, Listener, ListenerType};
pub use stream::{Dispatcher, MqttStream};
#[cfg(feature = "ws")]
pub use ws::WsStream;

pub type Error = anyhow::Error;
pub type Result<T> = anyhow::Result<T, Error>;
