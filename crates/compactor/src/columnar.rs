//! Columnar format of compacted blobs: Parquet with an embedded Arrow schema

use crate::error::Result;
use arrow_array::RecordBatch;
use arrow_schema::SchemaRef;
use bytes::Bytes;
use parquet::arrow::ArrowWriter;
use parquet::arrow::arrow_reader::{
    ArrowReaderMetadata, ArrowReaderOptions, ParquetRecordBatchReaderBuilder,
};
use parquet::file::properties::WriterProperties;

/// Leading and trailing magic of every Parquet file
pub const PARQUET_MAGIC: &[u8; 4] = b"PAR1";

/// `PAR1` + 4-byte footer length + `PAR1`; nothing shorter is a Parquet file
pub const MIN_PARQUET_SIZE: u64 = 12;

/// Everything stored in a columnar blob, grouped as it was written
#[derive(Debug, Clone)]
pub struct ColumnarContents {
    pub schema: SchemaRef,
    pub row_groups: Vec<Vec<RecordBatch>>,
}

impl ColumnarContents {
    pub fn batches(&self) -> impl Iterator<Item = &RecordBatch> {
        self.row_groups.iter().flatten()
    }

    pub fn num_rows(&self) -> usize {
        self.batches().map(RecordBatch::num_rows).sum()
    }
}

/// Decode a whole columnar blob
pub fn read(data: Bytes) -> Result<ColumnarContents> {
    let metadata = ArrowReaderMetadata::load(&data, ArrowReaderOptions::default())?;
    let schema = metadata.schema().clone();

    let mut row_groups = Vec::with_capacity(metadata.metadata().num_row_groups());
    for index in 0..metadata.metadata().num_row_groups() {
        let reader =
            ParquetRecordBatchReaderBuilder::new_with_metadata(data.clone(), metadata.clone())
                .with_row_groups(vec![index])
                .build()?;
        row_groups.push(reader.collect::<std::result::Result<Vec<_>, _>>()?);
    }
    Ok(ColumnarContents { schema, row_groups })
}

/// Decode only the footer's schema
pub fn read_schema_footer(data: Bytes) -> Result<SchemaRef> {
    let builder = ParquetRecordBatchReaderBuilder::try_new(data)?;
    Ok(builder.schema().clone())
}

/// Encode `row_groups` under `schema`.
///
/// Each element of `row_groups` is flushed as its own row group (split
/// further if it exceeds `max_row_group_size`). Every batch must already
/// conform to `schema`.
pub fn write(
    schema: &SchemaRef,
    row_groups: &[Vec<RecordBatch>],
    max_row_group_size: usize,
) -> Result<Bytes> {
    let props = WriterProperties::builder()
        .set_max_row_group_size(max_row_group_size)
        .build();
    let mut writer = ArrowWriter::try_new(Vec::new(), schema.clone(), Some(props))?;
    for group in row_groups {
        for batch in group {
            writer.write(batch)?;
        }
        writer.flush()?;
    }
    let buffer = writer.into_inner()?;
    Ok(Bytes::from(buffer))
}
