//! Event producers feeding the ingest buffer.

use crate::ingest::RawEventRecord;
use std::collections::VecDeque;

/// Source of raw event batches
///
/// Implement this for streaming or batch producers; the pipeline drains it
/// with [`crate::EngagementPipeline::drain`].
#[async_trait::async_trait]
pub trait EventProducer: Send {
    /// Next batch, `None` once the producer is exhausted
    async fn next_batch(&mut self) -> Option<Vec<RawEventRecord>>;
}

/// Producer replaying prepared batches
#[derive(Debug, Clone, Default)]
pub struct BatchReplay {
    batches: VecDeque<Vec<RawEventRecord>>,
}

impl BatchReplay {
    /// Replay `batches` in order
    pub fn new(batches: impl IntoIterator<Item = Vec<RawEventRecord>>) -> Self {
        Self {
            batches: batches.into_iter().collect(),
        }
    }

    /// Batches left
    #[must_use]
    pub fn remaining(&self) -> usize {
        self.batches.len()
    }
}

#[async_trait::async_trait]
impl EventProducer for BatchReplay {
    async fn next_batch(&mut self) -> Option<Vec<RawEventRecord>> {
        self.batches.pop_front()
    }
}
