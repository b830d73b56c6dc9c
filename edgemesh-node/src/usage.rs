//! Usage aggregation
//!
//! Transports emit one `UsageRecord` per chunk delivered. Reporting each of
//! those upstream would flood the master link, so records accumulate here and
//! are flushed on a fixed interval, merged by content, client and direction.
//! Records buffered while the master link is down are dropped by the
//! consumer, not retained; usage accounting is best-effort by design.

use edgemesh_core::{Direction, UsageRecord, USAGE_FLUSH_INTERVAL_MS};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, trace};

/// One flushed accounting entry, summed over an aggregation window
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AggregatedUsage {
    pub content_id: String,
    pub client_ip: String,
    pub direction: Direction,
    pub byte_count: u64,
    /// How many raw records were merged into this entry
    pub record_count: usize,
}

/// Interval-flushed usage buffer shared by all transport listeners
pub struct UsageAggregator {
    pending: Mutex<Vec<UsageRecord>>,
    flush_interval: Duration,
}

impl UsageAggregator {
    pub fn new() -> Self {
        Self::with_interval(Duration::from_millis(USAGE_FLUSH_INTERVAL_MS))
    }

    pub fn with_interval(flush_interval: Duration) -> Self {
        Self {
            pending: Mutex::new(Vec::new()),
            flush_interval,
        }
    }

    /// Buffer a raw record until the next flush
    pub fn record(&self, record: UsageRecord) {
        trace!(
            content_id = %record.content_id,
            client_ip = %record.client_ip,
            byte_count = record.byte_count,
            "Buffering usage record"
        );
        self.pending.lock().push(record);
    }

    /// Number of records waiting for the next flush
    pub fn pending_len(&self) -> usize {
        self.pending.lock().len()
    }

    /// Swap out the pending buffer and merge it into aggregated entries
    pub fn flush(&self) -> Vec<AggregatedUsage> {
        let batch = std::mem::take(&mut *self.pending.lock());
        group_records(batch)
    }

    /// Flush on the configured interval, forwarding aggregates to `tx`.
    /// Exits when the receiving side goes away.
    pub async fn run(self: Arc<Self>, tx: mpsc::Sender<AggregatedUsage>) {
        let mut interval = tokio::time::interval(self.flush_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            interval.tick().await;
            for aggregate in self.flush() {
                debug!(
                    content_id = %aggregate.content_id,
                    client_ip = %aggregate.client_ip,
                    byte_count = aggregate.byte_count,
                    records = aggregate.record_count,
                    "Flushing aggregated usage"
                );
                if tx.send(aggregate).await.is_err() {
                    return;
                }
            }
        }
    }
}

impl Default for UsageAggregator {
    fn default() -> Self {
        Self::new()
    }
}

/// Merge raw records by (content, client, direction), preserving first-seen
/// order of the groups
pub fn group_records(records: Vec<UsageRecord>) -> Vec<AggregatedUsage> {
    let mut index: HashMap<(String, String, Direction), usize> = HashMap::new();
    let mut grouped: Vec<AggregatedUsage> = Vec::new();

    for record in records {
        let key = (
            record.content_id.clone(),
            record.client_ip.clone(),
            record.direction,
        );
        match index.get(&key) {
            Some(&i) => {
                grouped[i].byte_count += record.byte_count;
                grouped[i].record_count += 1;
            }
            None => {
                index.insert(key, grouped.len());
                grouped.push(AggregatedUsage {
                    content_id: record.content_id,
                    client_ip: record.client_ip,
                    direction: record.direction,
                    byte_count: record.byte_count,
                    record_count: 1,
                });
            }
        }
    }

    grouped
}

#[cfg(test)]
mod tests {
    use super::*;
    use edgemesh_core::TransportKind;
    use proptest::prelude::*;

    fn record(content: &str, ip: &str, bytes: u64) -> UsageRecord {
        UsageRecord::uploaded(TransportKind::Http, ip, content, bytes)
    }

    #[test]
    fn groups_by_content_and_client() {
        let grouped = group_records(vec![
            record("abc", "1.1.1.1", 100),
            record("abc", "1.1.1.1", 50),
            record("abc", "2.2.2.2", 10),
            record("def", "1.1.1.1", 7),
        ]);

        assert_eq!(grouped.len(), 3);
        assert_eq!(grouped[0].byte_count, 150);
        assert_eq!(grouped[0].record_count, 2);
        assert_eq!(grouped[1].client_ip, "2.2.2.2");
        assert_eq!(grouped[2].content_id, "def");
    }

    #[test]
    fn directions_do_not_merge() {
        let mut down = record("abc", "1.1.1.1", 30);
        down.direction = Direction::Downloaded;
        let grouped = group_records(vec![record("abc", "1.1.1.1", 100), down]);
        assert_eq!(grouped.len(), 2);
    }

    #[test]
    fn flush_drains_the_buffer() {
        let aggregator = UsageAggregator::new();
        aggregator.record(record("abc", "1.1.1.1", 100));
        aggregator.record(record("abc", "1.1.1.1", 24));

        let flushed = aggregator.flush();
        assert_eq!(flushed.len(), 1);
        assert_eq!(flushed[0].byte_count, 124);

        assert_eq!(aggregator.pending_len(), 0);
        assert!(aggregator.flush().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn run_flushes_on_interval() {
        let aggregator = Arc::new(UsageAggregator::with_interval(Duration::from_millis(50)));
        let (tx, mut rx) = mpsc::channel(16);

        aggregator.record(record("abc", "1.1.1.1", 4096));
        let handle = tokio::spawn(aggregator.clone().run(tx));

        let aggregate = rx.recv().await.unwrap();
        assert_eq!(aggregate.content_id, "abc");
        assert_eq!(aggregate.byte_count, 4096);

        drop(rx);
        aggregator.record(record("abc", "1.1.1.1", 1));
        let _ = handle.await;
    }

    proptest! {
        #[test]
        fn grouping_conserves_bytes_and_records(
            records in prop::collection::vec(
                (0u8..4, 0u8..4, 1u64..10_000).prop_map(|(c, ip, bytes)| {
                    record(&format!("content-{c}"), &format!("10.0.0.{ip}"), bytes)
                }),
                0..64,
            )
        ) {
            let total_bytes: u64 = records.iter().map(|r| r.byte_count).sum();
            let total_records = records.len();

            let grouped = group_records(records);

            prop_assert_eq!(grouped.iter().map(|g| g.byte_count).sum::<u64>(), total_bytes);
            prop_assert_eq!(grouped.iter().map(|g| g.record_count).sum::<usize>(), total_records);
        }
    }
}
