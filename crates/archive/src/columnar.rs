//! Parquet encoding of archive rows.
//!
//! The archive schema mirrors the enriched stream record: eleven columns,
//! with `event_time` and `processing_time` as UTC millisecond timestamps.
//! Downstream readers depend on it; keep changes backwards-compatible.

use std::io::Cursor;
use std::sync::Arc;

use arrow::array::{
    Array as _, ArrayRef, BooleanArray, Float64Array, StringArray, TimestampMillisecondArray,
};
use arrow::datatypes::{DataType, Field, Schema, TimeUnit};
use arrow::record_batch::RecordBatch;
use bytes::Bytes;
use chrono::{DateTime, TimeZone, Utc};
use parquet::arrow::arrow_reader::ParquetRecordBatchReaderBuilder;
use parquet::arrow::ArrowWriter;
use parquet::basic::Compression;
use parquet::file::properties::WriterProperties;
use parquet::format::KeyValue;
use pipeline_core::{Error, HumidityCategory, ProcessedRecord, Result, TempTrend};

fn timestamp_type() -> DataType {
    DataType::Timestamp(TimeUnit::Millisecond, Some("UTC".into()))
}

/// Schema of archive files.
pub fn archive_schema() -> Arc<Schema> {
    Arc::new(Schema::new(vec![
        Field::new("sensor_id", DataType::Utf8, false),
        Field::new("event_time", timestamp_type(), false),
        Field::new("temperature", DataType::Float64, false),
        Field::new("humidity", DataType::Float64, false),
        Field::new("pressure", DataType::Float64, false),
        Field::new("temp_trend", DataType::Utf8, false),
        Field::new("humidity_category", DataType::Utf8, false),
        Field::new("comfort_index", DataType::Float64, false),
        Field::new("anomaly_score", DataType::Float64, false),
        Field::new("is_anomaly", DataType::Boolean, false),
        Field::new("processing_time", timestamp_type(), false),
    ]))
}

fn writer_properties() -> WriterProperties {
    let created_by = KeyValue {
        key: "created_by".to_string(),
        value: Some("sensor-pipeline".to_string()),
    };
    WriterProperties::builder()
        .set_compression(Compression::SNAPPY)
        .set_key_value_metadata(Some(vec![created_by]))
        .build()
}

fn to_batch(schema: Arc<Schema>, rows: &[ProcessedRecord]) -> Result<RecordBatch> {
    let f64_col = |f: fn(&ProcessedRecord) -> f64| {
        Arc::new(Float64Array::from(rows.iter().map(f).collect::<Vec<_>>()))
    };
    let ts_col = |f: fn(&ProcessedRecord) -> i64| {
        Arc::new(
            TimestampMillisecondArray::from(rows.iter().map(f).collect::<Vec<_>>())
                .with_timezone("UTC"),
        )
    };

    let columns: Vec<ArrayRef> = vec![
        Arc::new(StringArray::from(
            rows.iter().map(|r| r.sensor_id.as_str()).collect::<Vec<_>>(),
        )),
        ts_col(|r| r.event_time.timestamp_millis()),
        f64_col(|r| r.temperature),
        f64_col(|r| r.humidity),
        f64_col(|r| r.pressure),
        Arc::new(StringArray::from(
            rows.iter().map(|r| r.temp_trend.as_str()).collect::<Vec<_>>(),
        )),
        Arc::new(StringArray::from(
            rows.iter()
                .map(|r| r.humidity_category.as_str())
                .collect::<Vec<_>>(),
        )),
        f64_col(|r| r.comfort_index),
        f64_col(|r| r.anomaly_score),
        Arc::new(BooleanArray::from(
            rows.iter().map(|r| r.is_anomaly).collect::<Vec<_>>(),
        )),
        ts_col(|r| r.processing_time.timestamp_millis()),
    ];

    RecordBatch::try_new(schema, columns)
        .map_err(|e| Error::parquet(format!("record batch build failed: {}", e)))
}

/// Encodes rows as one Parquet file.
pub fn write_rows(rows: &[ProcessedRecord]) -> Result<Bytes> {
    let schema = archive_schema();
    let batch = to_batch(schema.clone(), rows)?;

    let mut cursor = Cursor::new(Vec::<u8>::new());
    let mut writer = ArrowWriter::try_new(&mut cursor, schema, Some(writer_properties()))
        .map_err(|e| Error::parquet(format!("parquet writer init failed: {}", e)))?;
    writer
        .write(&batch)
        .map_err(|e| Error::parquet(format!("parquet write failed: {}", e)))?;
    writer
        .close()
        .map_err(|e| Error::parquet(format!("parquet close failed: {}", e)))?;

    Ok(Bytes::from(cursor.into_inner()))
}

/// Decodes a Parquet file written by [`write_rows`].
pub fn read_rows(bytes: &Bytes) -> Result<Vec<ProcessedRecord>> {
    let reader = ParquetRecordBatchReaderBuilder::try_new(bytes.clone())
        .map_err(|e| Error::parquet(format!("parquet reader init failed: {}", e)))?
        .build()
        .map_err(|e| Error::parquet(format!("parquet reader build failed: {}", e)))?;

    let mut out = Vec::new();
    for batch in reader {
        let batch = batch.map_err(|e| Error::parquet(format!("parquet read failed: {}", e)))?;

        let sensor_id = col::<StringArray>(&batch, "sensor_id")?;
        let event_time = col::<TimestampMillisecondArray>(&batch, "event_time")?;
        let temperature = col::<Float64Array>(&batch, "temperature")?;
        let humidity = col::<Float64Array>(&batch, "humidity")?;
        let pressure = col::<Float64Array>(&batch, "pressure")?;
        let temp_trend = col::<StringArray>(&batch, "temp_trend")?;
        let humidity_category = col::<StringArray>(&batch, "humidity_category")?;
        let comfort_index = col::<Float64Array>(&batch, "comfort_index")?;
        let anomaly_score = col::<Float64Array>(&batch, "anomaly_score")?;
        let is_anomaly = col::<BooleanArray>(&batch, "is_anomaly")?;
        let processing_time = col::<TimestampMillisecondArray>(&batch, "processing_time")?;

        for row in 0..batch.num_rows() {
            out.push(ProcessedRecord {
                sensor_id: sensor_id.value(row).to_string(),
                event_time: timestamp(event_time.value(row))?,
                temperature: temperature.value(row),
                humidity: humidity.value(row),
                pressure: pressure.value(row),
                temp_trend: parse_trend(temp_trend.value(row))?,
                humidity_category: parse_humidity(humidity_category.value(row))?,
                comfort_index: comfort_index.value(row),
                anomaly_score: anomaly_score.value(row),
                is_anomaly: is_anomaly.value(row),
                processing_time: timestamp(processing_time.value(row))?,
            });
        }
    }
    Ok(out)
}

fn col<'a, A: 'static>(batch: &'a RecordBatch, name: &str) -> Result<&'a A> {
    let idx = batch
        .schema()
        .index_of(name)
        .map_err(|e| Error::parquet(format!("missing column '{}': {}", name, e)))?;

    batch
        .column(idx)
        .as_any()
        .downcast_ref::<A>()
        .ok_or_else(|| Error::parquet(format!("column '{}' has unexpected type", name)))
}

fn timestamp(ms: i64) -> Result<DateTime<Utc>> {
    Utc.timestamp_millis_opt(ms)
        .single()
        .ok_or_else(|| Error::parquet(format!("timestamp out of range: {}", ms)))
}

fn parse_trend(value: &str) -> Result<TempTrend> {
    match value {
        "HOT" => Ok(TempTrend::Hot),
        "COLD" => Ok(TempTrend::Cold),
        "NORMAL" => Ok(TempTrend::Normal),
        other => Err(Error::parquet(format!("unknown temp_trend '{}'", other))),
    }
}

fn parse_humidity(value: &str) -> Result<HumidityCategory> {
    match value {
        "HIGH" => Ok(HumidityCategory::High),
        "LOW" => Ok(HumidityCategory::Low),
        "MODERATE" => Ok(HumidityCategory::Moderate),
        other => Err(Error::parquet(format!("unknown humidity_category '{}'", other))),
    }
}
