use async_trait::async_trait;

use super::Storage;
use crate::cluster::Surveyee;
use crate::message::{Message, Ssid};
use crate::utils::TimestampNanos;
use crate::Result;

/// Stores nothing.
#[derive(Debug, Default)]
pub struct NoopStorage;

#[async_trait]
impl Storage for NoopStorage {
    fn name(&self) -> &'static str {
        "noop"
    }

    async fn store(&self, _msg: Message) -> Result<()> {
        Ok(())
    }

    async fn query(&self, _: &Ssid, _: TimestampNanos, _: TimestampNanos, _: usize) -> Result<Vec<Message>> {
        Ok(Vec::new())
    }
}

impl Surveyee for NoopStorage {
    fn on_survey(&self, _kind: &str, _payload: &[u8]) -> Option<Vec<u8>> {
        None
    }
}
