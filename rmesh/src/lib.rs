#![deny(unsafe_code)]

//! # Overall Example
//! ```rust,no_run
//!
//! use rmesh::context::ServerContext;
//! use rmesh::net::{Builder, Result};
//! use rmesh::security::License;
//! use rmesh::server::MqttServer;
//!
//! #[tokio::main]
//! async fn main() -> Result<()> {
//!    let scx = ServerContext::new(License::generate()).build().await?;
//!
//!    MqttServer::new(scx)
//!       .listener(Builder::new().name("external/tcp").laddr(([0, 0, 0, 0], 8080).into()).bind()?.tcp()?)
//!       .build()
//!       .run()
//!       .await?;
//!       Ok(())
//! }
//!
//! ```

pub mod broker; // Client requests and the connection loop
pub mod cluster; // Gossip mesh between brokers
pub mod context; // Shared execution context
pub mod logger;
pub mod message; // Messages, SSIDs and wire frames
pub mod security; // Licenses, keys, channels and contracts
pub mod server; // Client listeners
pub mod store; // Message storage
pub mod task;
pub mod trie; // Subscription trie

pub use net::{Error, Result};

pub use rmesh_codec as codec;
pub use rmesh_conf as conf;
pub use rmesh_net as net;
pub use rmesh_utils as utils;
