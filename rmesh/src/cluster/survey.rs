use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::sync::mpsc;
use tokio::time::Instant;

/// Asks every cluster member the same question and gathers the answers.
#[async_trait]
pub trait Surveyor: Send + Sync {
    /// Replies received before `deadline`, a partial set when some members are slow.
    async fn query(&self, kind: &str, payload: Vec<u8>, deadline: Duration) -> Vec<Vec<u8>>;
}

/// Answers surveys of one or more kinds.
pub trait Surveyee: Send + Sync {
    /// `None` when the survey is not for this surveyee.
    fn on_survey(&self, kind: &str, payload: &[u8]) -> Option<Vec<u8>>;
}

/// Surveys waiting for replies, keyed by survey id.
#[derive(Default)]
pub(crate) struct PendingSurveys {
    pending: DashMap<u64, mpsc::Sender<Vec<u8>>>,
}

impl PendingSurveys {
    /// Registers a new survey, it stays pending until the returned guard drops.
    pub(crate) fn begin(&self, capacity: usize) -> Survey<'_> {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        loop {
            let id = rand::random::<u64>();
            if let dashmap::mapref::entry::Entry::Vacant(e) = self.pending.entry(id) {
                e.insert(tx);
                return Survey { surveys: self, id, rx };
            }
        }
    }

    pub(crate) fn reply(&self, id: u64, payload: Vec<u8>) {
        let tx = self.pending.get(&id).map(|tx| tx.value().clone());
        match tx {
            Some(tx) => {
                if tx.try_send(payload).is_err() {
                    log::debug!("survey {} is full or finished, reply dropped", id);
                }
            }
            None => log::debug!("survey {} is not pending, late reply dropped", id),
        }
    }

    #[inline]
    pub(crate) fn len(&self) -> usize {
        self.pending.len()
    }
}

/// A pending survey, forgotten when dropped even if the gathering future
/// is cancelled half way.
pub(crate) struct Survey<'a> {
    surveys: &'a PendingSurveys,
    pub(crate) id: u64,
    rx: mpsc::Receiver<Vec<u8>>,
}

impl Survey<'_> {
    /// Collects up to `expected` non-empty replies until `deadline` passes.
    pub(crate) async fn gather(&mut self, expected: usize, deadline: Duration) -> Vec<Vec<u8>> {
        let until = Instant::now() + deadline;
        let mut replies = Vec::with_capacity(expected);
        let mut received = 0;
        while received < expected {
            match tokio::time::timeout_at(until, self.rx.recv()).await {
                Ok(Some(reply)) => {
                    received += 1;
                    if !reply.is_empty() {
                        replies.push(reply);
                    }
                }
                Ok(None) | Err(_) => break,
            }
        }
        replies
    }
}

impl Drop for Survey<'_> {
    fn drop(&mut self) {
        self.surveys.pending.remove(&self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn gathers_until_all_replied() {
        let surveys = PendingSurveys::default();
        let mut survey = surveys.begin(3);
        surveys.reply(survey.id, b"a".to_vec());
        surveys.reply(survey.id, Vec::new());
        surveys.reply(survey.id, b"b".to_vec());
        surveys.reply(survey.id + 1, b"stray".to_vec());
        let replies = survey.gather(3, Duration::from_secs(5)).await;
        assert_eq!(replies, vec![b"a".to_vec(), b"b".to_vec()]);
        drop(survey);
        assert_eq!(surveys.len(), 0);
    }

    #[tokio::test]
    async fn partial_on_deadline() {
        let surveys = PendingSurveys::default();
        let mut survey = surveys.begin(2);
        surveys.reply(survey.id, b"only".to_vec());
        let started = std::time::Instant::now();
        let replies = survey.gather(2, Duration::from_millis(50)).await;
        assert_eq!(replies, vec![b"only".to_vec()]);
        assert!(started.elapsed() >= Duration::from_millis(50));
    }

    #[tokio::test]
    async fn cancelled_survey_is_forgotten() {
        let surveys = PendingSurveys::default();
        let mut survey = surveys.begin(1);
        let id = survey.id;
        let gathering = tokio::time::timeout(Duration::from_millis(20), async move {
            survey.gather(1, Duration::from_secs(60)).await
        });
        assert!(gathering.await.is_err());
        assert_eq!(surveys.len(), 0);
        surveys.reply(id, b"late".to_vec());
        assert_eq!(surveys.len(), 0);
    }
}
