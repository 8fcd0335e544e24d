//! Row format of buffer blobs: newline-delimited JSON, one record per line

use crate::error::{CompactorError, Result};
use arrow::json::ReaderBuilder;
use arrow::json::reader::infer_json_schema;
use arrow_array::RecordBatch;
use arrow_schema::SchemaRef;
use bytes::{BufMut, Bytes, BytesMut};
use serde::Serialize;
use std::io::Cursor;
use std::sync::Arc;

const DECODE_BATCH_SIZE: usize = 8192;

/// Validate already-serialized records and join them into buffer lines
///
/// A record may carry one trailing newline; any other newline would split
/// it into two rows and is rejected, as are blank records.
pub fn frame<I, R>(records: I) -> Result<Bytes>
where
    I: IntoIterator<Item = R>,
    R: AsRef<[u8]>,
{
    let mut out = BytesMut::new();
    for (index, record) in records.into_iter().enumerate() {
        let bytes = record.as_ref();
        let bytes = bytes.strip_suffix(b"\n").unwrap_or(bytes);
        if bytes.iter().all(u8::is_ascii_whitespace) {
            return Err(CompactorError::InvalidRecord {
                index,
                reason: "record is empty".to_string(),
            });
        }
        if bytes.contains(&b'\n') {
            return Err(CompactorError::InvalidRecord {
                index,
                reason: "record contains a newline".to_string(),
            });
        }
        out.reserve(bytes.len() + 1);
        out.put_slice(bytes);
        out.put_u8(b'\n');
    }
    Ok(out.freeze())
}

/// Serialize records as JSON lines
pub fn encode_json<T: Serialize>(records: &[T]) -> Result<Bytes> {
    let serialized = records
        .iter()
        .map(serde_json::to_vec)
        .collect::<std::result::Result<Vec<_>, _>>()?;
    frame(serialized)
}

/// Records decoded from a buffer snapshot
#[derive(Debug, Clone)]
pub struct DecodedRows {
    /// Inferred from the records: fields in order of first appearance, all nullable
    pub schema: SchemaRef,
    pub batches: Vec<RecordBatch>,
}

impl DecodedRows {
    pub fn num_rows(&self) -> usize {
        self.batches.iter().map(RecordBatch::num_rows).sum()
    }
}

/// Decode a buffer snapshot. `None` when it holds no records.
pub fn decode(data: &[u8]) -> Result<Option<DecodedRows>> {
    let (schema, records) = infer_json_schema(Cursor::new(data), None)?;
    if records == 0 {
        return Ok(None);
    }

    // A field seen as both number and string is inferred as Utf8
    let schema = Arc::new(schema);
    let reader = ReaderBuilder::new(schema.clone())
        .with_batch_size(DECODE_BATCH_SIZE)
        .with_coerce_primitive(true)
        .build(Cursor::new(data))?;
    let batches = reader.collect::<std::result::Result<Vec<_>, _>>()?;

    Ok(Some(DecodedRows { schema, batches }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use arrow::array::{Array, Int64Array, StringArray};
    use arrow_schema::DataType;
    use serde::Serialize;

    #[derive(Serialize)]
    struct Reading {
        id: i64,
        name: String,
    }

    #[test]
    fn test_frame_adds_newlines() {
        let framed = frame([&b"{\"a\":1}"[..], &b"{\"a\":2}\n"[..]]).unwrap();
        assert_eq!(framed, Bytes::from_static(b"{\"a\":1}\n{\"a\":2}\n"));
    }

    #[test]
    fn test_frame_rejects_bad_records() {
        let err = frame([&b"{}"[..], &b"{\"a\":\n1}"[..]]).unwrap_err();
        assert!(matches!(err, CompactorError::InvalidRecord { index: 1, .. }));

        let err = frame([&b"  \n"[..]]).unwrap_err();
        assert!(matches!(err, CompactorError::InvalidRecord { index: 0, .. }));
    }

    #[test]
    fn test_decode_preserves_order_and_infers_schema() {
        let data = encode_json(&[
            Reading { id: 1, name: "a".into() },
            Reading { id: 2, name: "b".into() },
            Reading { id: 3, name: "c".into() },
        ])
        .unwrap();

        let rows = decode(&data).unwrap().unwrap();
        assert_eq!(rows.num_rows(), 3);

        let names: Vec<&str> = rows.schema.fields().iter().map(|f| f.name().as_str()).collect();
        assert_eq!(names, vec!["id", "name"]);
        assert!(rows.schema.fields().iter().all(|f| f.is_nullable()));
        assert_eq!(rows.schema.field(0).data_type(), &DataType::Int64);

        let batch = &rows.batches[0];
        let ids = batch.column(0).as_any().downcast_ref::<Int64Array>().unwrap();
        assert_eq!(ids.values().to_vec(), vec![1, 2, 3]);
        let names = batch.column(1).as_any().downcast_ref::<StringArray>().unwrap();
        assert_eq!(names.value(2), "c");
    }

    #[test]
    fn test_decode_sparse_fields() {
        let data = b"{\"id\":1}\n\n{\"id\":2,\"email\":\"x@y\"}\n";
        let rows = decode(data).unwrap().unwrap();
        assert_eq!(rows.num_rows(), 2);
        assert_eq!(rows.schema.fields().len(), 2);

        let email = rows.batches[0].column_by_name("email").unwrap();
        assert!(email.is_null(0));
        assert!(!email.is_null(1));
    }

    #[test]
    fn test_decode_mixed_value_types() {
        let rows = decode(b"{\"v\":1}\n{\"v\":\"x\"}\n").unwrap().unwrap();
        assert_eq!(rows.num_rows(), 2);
        assert_eq!(rows.schema.field(0).data_type(), &DataType::Utf8);

        let values = rows.batches[0]
            .column(0)
            .as_any()
            .downcast_ref::<StringArray>()
            .unwrap();
        assert_eq!(values.value(0), "1");
        assert_eq!(values.value(1), "x");
    }

    #[test]
    fn test_decode_empty_snapshot() {
        assert!(decode(b"").unwrap().is_none());
        assert!(decode(b"\n\n").unwrap().is_none());
    }

    #[test]
    fn test_decode_rejects_non_objects() {
        assert!(decode(b"[1,2,3]\n").is_err());
    }
}
