//! Message storage providers.

use std::sync::Arc;

use anyhow::anyhow;
use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::cluster::{Surveyee, Surveyor};
use crate::conf;
use crate::message::{Message, Ssid};
use crate::utils::TimestampNanos;
use crate::Result;

mod memory;
mod noop;

pub use memory::{InMemoryStorage, LookupQuery, SURVEY_KIND};
pub use noop::NoopStorage;

#[async_trait]
pub trait Storage: Surveyee + Send + Sync {
    fn name(&self) -> &'static str;

    /// Keeps `msg` for its ttl.
    async fn store(&self, msg: Message) -> Result<()>;

    /// Up to `limit` of the newest stored messages matching `ssid` with
    /// `from <= time <= until`, oldest first.
    async fn query(
        &self,
        ssid: &Ssid,
        from: TimestampNanos,
        until: TimestampNanos,
        limit: usize,
    ) -> Result<Vec<Message>>;

    /// Lets queries reach the rest of the cluster.
    fn attach(&self, _surveyor: Arc<dyn Surveyor>) {}
}

/// Lets the cluster survey a storage provider.
struct StorageSurveyee(Arc<dyn Storage>);

impl Surveyee for StorageSurveyee {
    fn on_survey(&self, kind: &str, payload: &[u8]) -> Option<Vec<u8>> {
        self.0.on_survey(kind, payload)
    }
}

#[inline]
pub fn surveyee(storage: &Arc<dyn Storage>) -> Arc<dyn Surveyee> {
    Arc::new(StorageSurveyee(storage.clone()))
}

/// Builds the provider named by `storage.provider`.
pub fn new_storage(cfg: &conf::Storage, token: CancellationToken) -> Result<Arc<dyn Storage>> {
    match cfg.provider.as_str() {
        "noop" => Ok(Arc::new(NoopStorage)),
        "" | "inmemory" => Ok(InMemoryStorage::new(&cfg.config).start(token)),
        other => Err(anyhow!("unsupported storage provider {:?}", other)),
    }
}
