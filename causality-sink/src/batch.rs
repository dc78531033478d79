use lapin::message::Delivery;
use std::collections::HashMap;

use causality_shared::types::{Envelope, PartitionKey};

/// A decoded envelope still holding its broker delivery handle, so the
/// flush path can ACK or NAK the exact message once the partition write
/// settles.
pub struct TrackedEvent {
    pub envelope: Envelope,
    pub delivery: Delivery,
}

/// Group a flush snapshot by storage partition, preserving append order
/// within each partition.
pub fn group_by_partition(events: Vec<TrackedEvent>) -> HashMap<PartitionKey, Vec<TrackedEvent>> {
    let mut partitions: HashMap<PartitionKey, Vec<TrackedEvent>> = HashMap::new();
    for event in events {
        partitions
            .entry(event.envelope.partition_key())
            .or_default()
            .push(event);
    }
    partitions
}

#[cfg(test)]
mod tests {
    use super::*;

    // Grouping itself is exercised on bare envelopes: the delivery handle
    // plays no part in partition derivation.
    fn envelope(app_id: &str, ts: i64, id: &str) -> Envelope {
        let json = format!(
            r#"{{"id":"{id}","app_id":"{app_id}","timestamp_ms":{ts},"screen_view":{{"screen_name":"home"}}}}"#
        );
        serde_json::from_str(&json).unwrap()
    }

    fn group_envelopes(envelopes: Vec<Envelope>) -> HashMap<PartitionKey, Vec<Envelope>> {
        let mut partitions: HashMap<PartitionKey, Vec<Envelope>> = HashMap::new();
        for envelope in envelopes {
            partitions
                .entry(envelope.partition_key())
                .or_default()
                .push(envelope);
        }
        partitions
    }

    #[test]
    fn splits_by_app_and_hour() {
        const HOUR_MS: i64 = 3_600_000;
        let base = 1_706_918_400_000; // 2024-02-03 00:00:00 UTC
        let groups = group_envelopes(vec![
            envelope("demo", base, "a"),
            envelope("demo", base + 1, "b"),
            envelope("demo", base + HOUR_MS, "c"),
            envelope("other", base, "d"),
        ]);

        assert_eq!(groups.len(), 3);
        let demo_hour0 = PartitionKey::from_timestamp_ms("demo", base);
        assert_eq!(groups[&demo_hour0].len(), 2);
    }

    #[test]
    fn preserves_append_order_within_partition() {
        let base = 1_706_918_400_000;
        let groups = group_envelopes(vec![
            envelope("demo", base, "first"),
            envelope("demo", base + 1, "second"),
            envelope("demo", base + 2, "third"),
        ]);
        let key = PartitionKey::from_timestamp_ms("demo", base);
        let ids: Vec<&str> = groups[&key].iter().map(|e| e.id.as_str()).collect();
        assert_eq!(ids, vec!["first", "second", "third"]);
    }
}
