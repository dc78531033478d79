use chrono::Utc;
use metrics::counter;
use parquet::arrow::arrow_reader::ParquetRecordBatchReaderBuilder;
use parquet::arrow::ArrowWriter;
use parquet::basic::Compression;
use parquet::file::properties::WriterProperties;
use rand::Rng;
use regex::Regex;
use std::collections::BTreeMap;
use std::sync::OnceLock;

use causality_shared::clients::object_store::{ObjectMeta, ObjectStoreClient};
use causality_shared::types::PartitionKey;

use crate::config::AppConfig;

fn partition_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?:.*/)?app_id=([^/]+)/year=(\d+)/month=(\d+)/day=(\d+)/hour=(\d+)/$")
            .expect("partition regex is valid")
    })
}

/// Extract the partition from an object key's directory prefix.
/// Returns `(prefix, partition)` or `None` for keys outside the layout.
pub fn parse_partition(key: &str) -> Option<(String, PartitionKey)> {
    let slash = key.rfind('/')?;
    let prefix = &key[..=slash];
    let captures = partition_regex().captures(prefix)?;

    Some((
        prefix.to_string(),
        PartitionKey {
            app_id: captures.get(1)?.as_str().to_string(),
            year: captures.get(2)?.as_str().parse().ok()?,
            month: captures.get(3)?.as_str().parse().ok()?,
            day: captures.get(4)?.as_str().parse().ok()?,
            hour: captures.get(5)?.as_str().parse().ok()?,
        },
    ))
}

/// Greedy size-bounded grouping: scan files in list order, starting a new
/// batch whenever the next file would push the batch past `target_size`.
/// Batches below `min_files` are discarded (nothing worth merging).
pub fn plan_batches(
    files: &[ObjectMeta],
    target_size: i64,
    min_files: usize,
) -> Vec<Vec<ObjectMeta>> {
    let mut batches = Vec::new();
    let mut current: Vec<ObjectMeta> = Vec::new();
    let mut current_size = 0i64;

    for file in files {
        if !current.is_empty() && current_size + file.size > target_size {
            batches.push(std::mem::take(&mut current));
            current_size = 0;
        }
        current_size += file.size;
        current.push(file.clone());
    }
    if !current.is_empty() {
        batches.push(current);
    }

    batches.retain(|batch| batch.len() >= min_files);
    batches
}

/// Merge Parquet files into one, preserving file order and row order within
/// each file. The schema is taken from the first batch.
pub fn merge_parquet_files(files: &[Vec<u8>]) -> anyhow::Result<Vec<u8>> {
    anyhow::ensure!(!files.is_empty(), "nothing to merge");

    let mut batches = Vec::new();
    for bytes in files {
        let reader =
            ParquetRecordBatchReaderBuilder::try_new(bytes::Bytes::from(bytes.clone()))?.build()?;
        for batch in reader {
            batches.push(batch?);
        }
    }

    let schema = match batches.first() {
        Some(batch) => batch.schema(),
        None => anyhow::bail!("input files contained no rows"),
    };

    let props = WriterProperties::builder()
        .set_compression(Compression::SNAPPY)
        .build();

    let mut output = Vec::new();
    let mut writer = ArrowWriter::try_new(&mut output, schema, Some(props))?;
    for batch in &batches {
        writer.write(batch)?;
    }
    writer.close()?;

    Ok(output)
}

#[derive(Debug, Default)]
pub struct RunStats {
    pub partitions_scanned: usize,
    pub partitions_compacted: usize,
    pub files_merged: usize,
    pub files_written: usize,
}

/// One compaction sweep over every cold partition. Per-partition failures
/// are logged and do not abort the run.
pub async fn run_once(store: &ObjectStoreClient, config: &AppConfig) -> anyhow::Result<RunStats> {
    let objects = store.list(&config.store_prefix).await?;

    // Partition prefixes in stable order, objects in list order within each.
    let mut partitions: BTreeMap<String, (PartitionKey, Vec<ObjectMeta>)> = BTreeMap::new();
    for object in objects {
        if let Some((prefix, partition)) = parse_partition(&object.key) {
            partitions
                .entry(prefix)
                .or_insert_with(|| (partition, Vec::new()))
                .1
                .push(object);
        }
    }

    let now = Utc::now();
    let mut stats = RunStats {
        partitions_scanned: partitions.len(),
        ..Default::default()
    };

    for (prefix, (partition, objects)) in partitions {
        // Only partitions strictly before the current UTC hour; the live
        // hour is still receiving sink writes.
        if !partition.is_cold(now) {
            continue;
        }

        let small: Vec<ObjectMeta> = objects
            .into_iter()
            .filter(|object| object.size < config.target_size_bytes)
            .collect();
        if small.len() < config.min_files {
            continue;
        }

        let batches = plan_batches(&small, config.target_size_bytes, config.min_files);
        if batches.is_empty() {
            continue;
        }

        match compact_partition(store, &prefix, &batches).await {
            Ok((merged, written)) => {
                stats.partitions_compacted += 1;
                stats.files_merged += merged;
                stats.files_written += written;
                counter!("compactor_partitions_compacted_total").increment(1);
            }
            Err(e) => {
                counter!("compactor_partition_failures_total").increment(1);
                tracing::error!(prefix = %prefix, error = %e, "partition compaction failed");
            }
        }
    }

    Ok(stats)
}

/// Merge each planned batch: download, merge, upload the compacted file,
/// then delete the originals. A crash after upload but before delete leaves
/// a superset of rows; the deletes finishing restores exact equivalence.
async fn compact_partition(
    store: &ObjectStoreClient,
    prefix: &str,
    batches: &[Vec<ObjectMeta>],
) -> anyhow::Result<(usize, usize)> {
    let mut files_merged = 0;
    let mut files_written = 0;

    for batch in batches {
        let mut contents = Vec::with_capacity(batch.len());
        for object in batch {
            contents.push(store.get(&object.key).await?);
        }

        let merged = merge_parquet_files(&contents)?;
        let merged_len = merged.len();
        let key = format!("{prefix}events_compacted_{}.parquet", random_suffix());
        store.put(&key, merged).await?;

        let originals: Vec<String> = batch.iter().map(|object| object.key.clone()).collect();
        store.delete_batch(&originals).await?;

        counter!("compactor_files_merged_total").increment(batch.len() as u64);
        tracing::info!(
            key = %key,
            merged_files = batch.len(),
            bytes = merged_len,
            "batch compacted"
        );

        files_merged += batch.len();
        files_written += 1;
    }

    Ok((files_merged, files_written))
}

fn random_suffix() -> String {
    let bytes: [u8; 8] = rand::thread_rng().gen();
    hex::encode(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use arrow::array::{ArrayRef, Int64Array};
    use arrow::datatypes::{DataType, Field, Schema};
    use arrow::record_batch::RecordBatch;
    use std::sync::Arc;

    fn meta(key: &str, size: i64) -> ObjectMeta {
        ObjectMeta {
            key: key.to_string(),
            size,
        }
    }

    #[test]
    fn parses_partition_prefixes() {
        let (prefix, partition) =
            parse_partition("events/app_id=demo/year=2024/month=2/day=3/hour=0/events_ab.parquet")
                .unwrap();
        assert_eq!(prefix, "events/app_id=demo/year=2024/month=2/day=3/hour=0/");
        assert_eq!(partition.app_id, "demo");
        assert_eq!(
            (partition.year, partition.month, partition.day, partition.hour),
            (2024, 2, 3, 0)
        );

        assert!(parse_partition("events/stray.parquet").is_none());
        assert!(parse_partition("events/app_id=demo/year=2024/notes.txt").is_none());
    }

    #[test]
    fn greedy_batching_respects_target_size() {
        const MIB: i64 = 1024 * 1024;
        let files: Vec<ObjectMeta> = (0..20).map(|i| meta(&format!("f{i}"), 6 * MIB)).collect();

        // 20 files of 6 MiB (120 MiB) fit one 128 MiB batch.
        let batches = plan_batches(&files, 128 * MIB, 2);
        assert_eq!(batches.len(), 1);
        assert_eq!(batches[0].len(), 20);

        let batches = plan_batches(&files, 60 * MIB, 2);
        // 10 files of 6 MiB per batch.
        assert_eq!(batches.len(), 2);
        assert!(batches.iter().all(|b| b.len() == 10));
    }

    #[test]
    fn undersized_batches_are_discarded() {
        const MIB: i64 = 1024 * 1024;
        let files = vec![meta("a", 6 * MIB), meta("b", 6 * MIB), meta("c", 6 * MIB)];
        // Target fits one file per batch; singleton batches fall below
        // min_files and nothing is planned.
        let batches = plan_batches(&files, 6 * MIB, 2);
        assert!(batches.is_empty());
    }

    #[test]
    fn preserves_list_order() {
        let files = vec![meta("a", 1), meta("b", 1), meta("c", 1)];
        let batches = plan_batches(&files, 100, 2);
        let keys: Vec<&str> = batches[0].iter().map(|f| f.key.as_str()).collect();
        assert_eq!(keys, vec!["a", "b", "c"]);
    }

    fn parquet_with_values(values: Vec<i64>) -> Vec<u8> {
        let schema = Arc::new(Schema::new(vec![Field::new("v", DataType::Int64, false)]));
        let batch = RecordBatch::try_new(
            schema.clone(),
            vec![Arc::new(Int64Array::from(values)) as ArrayRef],
        )
        .unwrap();
        let mut buffer = Vec::new();
        let mut writer = ArrowWriter::try_new(&mut buffer, schema, None).unwrap();
        writer.write(&batch).unwrap();
        writer.close().unwrap();
        buffer
    }

    fn read_values(bytes: Vec<u8>) -> Vec<i64> {
        let reader = ParquetRecordBatchReaderBuilder::try_new(bytes::Bytes::from(bytes))
            .unwrap()
            .build()
            .unwrap();
        let mut values = Vec::new();
        for batch in reader {
            let batch = batch.unwrap();
            let column = batch
                .column(0)
                .as_any()
                .downcast_ref::<Int64Array>()
                .unwrap();
            values.extend(column.values().iter().copied());
        }
        values
    }

    #[test]
    fn merge_preserves_row_multiset_and_order() {
        let merged = merge_parquet_files(&[
            parquet_with_values(vec![1, 2, 3]),
            parquet_with_values(vec![4, 5]),
            parquet_with_values(vec![6]),
        ])
        .unwrap();
        assert_eq!(read_values(merged), vec![1, 2, 3, 4, 5, 6]);
    }

    #[test]
    fn merge_rejects_empty_input() {
        assert!(merge_parquet_files(&[]).is_err());
    }
}
