use std::sync::Arc;

use anyhow::Context;
use arrow::array::{ArrayRef, Int32Builder, Int64Builder, StringBuilder};
use arrow::datatypes::{DataType, Field, Schema};
use arrow::record_batch::RecordBatch;
use parquet::arrow::ArrowWriter;
use parquet::basic::Compression;
use parquet::file::properties::WriterProperties;

use causality_shared::types::Envelope;

/// Flat warehouse schema: envelope scalars, derived category/type, the
/// payload variant as JSON, a few extracted device-context columns, and the
/// partition columns repeated per row so readers can prune without parsing
/// paths.
pub fn warehouse_schema() -> Arc<Schema> {
    Arc::new(Schema::new(vec![
        Field::new("id", DataType::Utf8, false),
        Field::new("idempotency_key", DataType::Utf8, false),
        Field::new("app_id", DataType::Utf8, false),
        Field::new("device_id", DataType::Utf8, true),
        Field::new("user_id", DataType::Utf8, true),
        Field::new("timestamp_ms", DataType::Int64, false),
        Field::new("correlation_id", DataType::Utf8, true),
        Field::new("category", DataType::Utf8, false),
        Field::new("event_type", DataType::Utf8, false),
        Field::new("payload_json", DataType::Utf8, false),
        Field::new("platform", DataType::Utf8, true),
        Field::new("os_version", DataType::Utf8, true),
        Field::new("app_version", DataType::Utf8, true),
        Field::new("locale", DataType::Utf8, true),
        Field::new("network_type", DataType::Utf8, true),
        Field::new("year", DataType::Int32, false),
        Field::new("month", DataType::Int32, false),
        Field::new("day", DataType::Int32, false),
        Field::new("hour", DataType::Int32, false),
    ]))
}

/// Convert envelopes to a record batch, preserving slice order.
pub fn to_record_batch(envelopes: &[Envelope]) -> anyhow::Result<RecordBatch> {
    let mut id = StringBuilder::new();
    let mut idempotency_key = StringBuilder::new();
    let mut app_id = StringBuilder::new();
    let mut device_id = StringBuilder::new();
    let mut user_id = StringBuilder::new();
    let mut timestamp_ms = Int64Builder::new();
    let mut correlation_id = StringBuilder::new();
    let mut category = StringBuilder::new();
    let mut event_type = StringBuilder::new();
    let mut payload_json = StringBuilder::new();
    let mut platform = StringBuilder::new();
    let mut os_version = StringBuilder::new();
    let mut app_version = StringBuilder::new();
    let mut locale = StringBuilder::new();
    let mut network_type = StringBuilder::new();
    let mut year = Int32Builder::new();
    let mut month = Int32Builder::new();
    let mut day = Int32Builder::new();
    let mut hour = Int32Builder::new();

    for envelope in envelopes {
        let partition = envelope.partition_key();
        let (event_category, event_type_name, payload_value) = match &envelope.payload {
            Some(payload) => (
                payload.category(),
                payload.event_type(),
                serde_json::to_value(payload).unwrap_or(serde_json::Value::Null),
            ),
            None => ("custom", "custom".to_string(), serde_json::Value::Null),
        };

        id.append_value(&envelope.id);
        idempotency_key.append_value(&envelope.idempotency_key);
        app_id.append_value(&envelope.app_id);
        device_id.append_option(envelope.device_id.as_deref());
        user_id.append_option(envelope.user_id.as_deref());
        timestamp_ms.append_value(envelope.timestamp_ms);
        correlation_id.append_option(envelope.correlation_id.as_deref());
        category.append_value(event_category);
        event_type.append_value(&event_type_name);
        payload_json.append_value(payload_value.to_string());

        let ctx = envelope.device_context.as_ref();
        platform.append_option(ctx.and_then(|c| c.platform.as_deref()));
        os_version.append_option(ctx.and_then(|c| c.os_version.as_deref()));
        app_version.append_option(ctx.and_then(|c| c.app_version.as_deref()));
        locale.append_option(ctx.and_then(|c| c.locale.as_deref()));
        network_type.append_option(ctx.and_then(|c| c.network_type.as_deref()));

        year.append_value(partition.year);
        month.append_value(partition.month as i32);
        day.append_value(partition.day as i32);
        hour.append_value(partition.hour as i32);
    }

    let columns: Vec<ArrayRef> = vec![
        Arc::new(id.finish()),
        Arc::new(idempotency_key.finish()),
        Arc::new(app_id.finish()),
        Arc::new(device_id.finish()),
        Arc::new(user_id.finish()),
        Arc::new(timestamp_ms.finish()),
        Arc::new(correlation_id.finish()),
        Arc::new(category.finish()),
        Arc::new(event_type.finish()),
        Arc::new(payload_json.finish()),
        Arc::new(platform.finish()),
        Arc::new(os_version.finish()),
        Arc::new(app_version.finish()),
        Arc::new(locale.finish()),
        Arc::new(network_type.finish()),
        Arc::new(year.finish()),
        Arc::new(month.finish()),
        Arc::new(day.finish()),
        Arc::new(hour.finish()),
    ];

    RecordBatch::try_new(warehouse_schema(), columns).context("failed to build record batch")
}

pub fn compression_from_str(name: &str) -> Compression {
    match name.to_ascii_lowercase().as_str() {
        "none" | "uncompressed" => Compression::UNCOMPRESSED,
        "snappy" => Compression::SNAPPY,
        other => {
            tracing::warn!(compression = %other, "unknown parquet compression, using snappy");
            Compression::SNAPPY
        }
    }
}

/// Encode one partition's envelopes as a single Parquet file.
pub fn encode_partition(
    envelopes: &[Envelope],
    compression: Compression,
    row_group_size: usize,
) -> anyhow::Result<Vec<u8>> {
    let batch = to_record_batch(envelopes)?;

    let props = WriterProperties::builder()
        .set_compression(compression)
        .set_max_row_group_size(row_group_size)
        .build();

    let mut buffer = Vec::new();
    let mut writer = ArrowWriter::try_new(&mut buffer, batch.schema(), Some(props))
        .context("failed to create parquet writer")?;
    writer.write(&batch).context("failed to write row group")?;
    writer.close().context("failed to finalize parquet file")?;

    Ok(buffer)
}

#[cfg(test)]
mod tests {
    use super::*;
    use arrow::array::{Array, StringArray};
    use parquet::arrow::arrow_reader::ParquetRecordBatchReaderBuilder;

    fn sample(id: &str, ts: i64) -> Envelope {
        let json = format!(
            r#"{{"id":"{id}","idempotency_key":"ik-{id}","app_id":"demo","timestamp_ms":{ts},"screen_view":{{"screen_name":"home"}}}}"#
        );
        serde_json::from_str(&json).unwrap()
    }

    fn read_ids(bytes: Vec<u8>) -> Vec<String> {
        let reader = ParquetRecordBatchReaderBuilder::try_new(bytes::Bytes::from(bytes))
            .unwrap()
            .build()
            .unwrap();
        let mut ids = Vec::new();
        for batch in reader {
            let batch = batch.unwrap();
            let column = batch
                .column_by_name("id")
                .unwrap()
                .as_any()
                .downcast_ref::<StringArray>()
                .unwrap();
            for i in 0..column.len() {
                ids.push(column.value(i).to_string());
            }
        }
        ids
    }

    #[test]
    fn encode_preserves_row_order() {
        let envelopes = vec![
            sample("a", 1_706_918_400_000),
            sample("b", 1_706_918_400_001),
            sample("c", 1_706_918_400_002),
        ];
        let bytes = encode_partition(&envelopes, Compression::SNAPPY, 1024).unwrap();
        assert_eq!(read_ids(bytes), vec!["a", "b", "c"]);
    }

    #[test]
    fn partition_columns_match_timestamp() {
        // 2024-02-03 00:00:00 UTC
        let batch = to_record_batch(&[sample("a", 1_706_918_400_000)]).unwrap();
        let year = batch
            .column_by_name("year")
            .unwrap()
            .as_any()
            .downcast_ref::<arrow::array::Int32Array>()
            .unwrap();
        assert_eq!(year.value(0), 2024);
        let hour = batch
            .column_by_name("hour")
            .unwrap()
            .as_any()
            .downcast_ref::<arrow::array::Int32Array>()
            .unwrap();
        assert_eq!(hour.value(0), 0);
    }

    #[test]
    fn payload_json_carries_variant_fields() {
        let batch = to_record_batch(&[sample("a", 1)]).unwrap();
        let payload = batch
            .column_by_name("payload_json")
            .unwrap()
            .as_any()
            .downcast_ref::<StringArray>()
            .unwrap();
        let value: serde_json::Value = serde_json::from_str(payload.value(0)).unwrap();
        assert_eq!(value["screen_view"]["screen_name"], "home");
    }

    #[test]
    fn compression_names() {
        assert_eq!(compression_from_str("snappy"), Compression::SNAPPY);
        assert_eq!(compression_from_str("NONE"), Compression::UNCOMPRESSED);
        assert_eq!(compression_from_str("zstd"), Compression::SNAPPY);
    }
}
