//! Schema evolution for columnar targets
//!
//! A target's schema only ever widens: existing fields keep their order,
//! type and nullability, and fields seen for the first time are appended
//! as nullable columns. Rows written before a field existed read back as
//! null for it.

use crate::error::{CompactorError, Result};
use arrow::array::new_null_array;
use arrow::compute::{CastOptions, can_cast_types, cast_with_options};
use arrow_array::{Array, ArrayRef, RecordBatch, RecordBatchOptions};
use arrow_schema::{FieldRef, Schema, SchemaRef};
use std::collections::HashSet;
use std::sync::Arc;

/// Widen `existing` with the fields of `incoming` it lacks.
///
/// Names are matched exactly. A name repeated within `incoming` keeps its
/// first occurrence. Schema-level metadata comes from `existing`.
pub fn evolve(existing: &Schema, incoming: &Schema) -> Schema {
    let mut fields: Vec<FieldRef> = existing.fields().iter().cloned().collect();
    let mut seen: HashSet<&str> = existing
        .fields()
        .iter()
        .map(|f| f.name().as_str())
        .collect();

    for field in incoming.fields() {
        if seen.insert(field.name().as_str()) {
            fields.push(Arc::new(field.as_ref().clone().with_nullable(true)));
        }
    }

    Schema::new_with_metadata(fields, existing.metadata().clone())
}

/// Names in `merged` that `existing` does not have, in order
pub fn added_fields(existing: &Schema, merged: &Schema) -> Vec<String> {
    merged
        .fields()
        .iter()
        .filter(|f| existing.field_with_name(f.name()).is_err())
        .map(|f| f.name().clone())
        .collect()
}

/// Project `batch` onto `target`.
///
/// Columns are matched by name and cast to the target type when they
/// differ; a value that does not survive the cast is a `SchemaConflict`.
/// Target fields the batch lacks become all-null columns.
pub fn conform(batch: &RecordBatch, target: &SchemaRef) -> Result<RecordBatch> {
    if batch.schema() == *target {
        return Ok(batch.clone());
    }

    let rows = batch.num_rows();
    let cast_options = CastOptions {
        safe: false,
        ..Default::default()
    };

    let mut columns: Vec<ArrayRef> = Vec::with_capacity(target.fields().len());
    for field in target.fields() {
        let conflict = |message: String| CompactorError::SchemaConflict {
            field: field.name().clone(),
            existing: field.data_type().to_string(),
            message,
        };

        let column = match batch.column_by_name(field.name()) {
            Some(column) if column.data_type() == field.data_type() => column.clone(),
            Some(column) => {
                if !can_cast_types(column.data_type(), field.data_type()) {
                    return Err(conflict(format!(
                        "incoming values are {}",
                        column.data_type()
                    )));
                }
                let cast = cast_with_options(column, field.data_type(), &cast_options)
                    .map_err(|e| conflict(e.to_string()))?;
                if !round_trips(column, &cast, &cast_options) {
                    return Err(conflict(format!(
                        "{} values do not convert without loss",
                        column.data_type()
                    )));
                }
                cast
            }
            None => new_null_array(field.data_type(), rows),
        };

        if !field.is_nullable() && column.null_count() > 0 {
            return Err(conflict(format!(
                "{} of {rows} rows have no value for a non-nullable column",
                column.null_count()
            )));
        }
        columns.push(column);
    }

    let options = RecordBatchOptions::new().with_row_count(Some(rows));
    Ok(RecordBatch::try_new_with_options(
        target.clone(),
        columns,
        &options,
    )?)
}

/// Whether `cast` converts back to exactly `original`, nulls included.
///
/// Casts such as Float64 to Int64 succeed by truncating; this catches them.
fn round_trips(original: &ArrayRef, cast: &ArrayRef, options: &CastOptions<'_>) -> bool {
    if !can_cast_types(cast.data_type(), original.data_type()) {
        return false;
    }
    match cast_with_options(cast, original.data_type(), options) {
        Ok(back) => back.as_ref() == original.as_ref(),
        Err(_) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use arrow::array::{Array, Float64Array, Int64Array, StringArray};
    use arrow_schema::{DataType, Field};

    fn schema(fields: &[(&str, DataType, bool)]) -> Schema {
        Schema::new(
            fields
                .iter()
                .map(|(name, dt, nullable)| Field::new(*name, dt.clone(), *nullable))
                .collect::<Vec<_>>(),
        )
    }

    fn names(schema: &Schema) -> Vec<&str> {
        schema.fields().iter().map(|f| f.name().as_str()).collect()
    }

    #[test]
    fn test_evolve_appends_new_fields_as_nullable() {
        let existing = schema(&[
            ("id", DataType::Int64, false),
            ("name", DataType::Utf8, true),
        ]);
        let incoming = schema(&[
            ("email", DataType::Utf8, false),
            ("id", DataType::Utf8, true),
            ("age", DataType::Int64, false),
        ]);

        let merged = evolve(&existing, &incoming);
        assert_eq!(names(&merged), vec!["id", "name", "email", "age"]);

        // Existing fields untouched, type and nullability included
        assert_eq!(merged.field(0), existing.field(0));
        assert_eq!(merged.field(1), existing.field(1));
        assert!(merged.field(2).is_nullable());
        assert!(merged.field(3).is_nullable());
        assert_eq!(merged.field(3).data_type(), &DataType::Int64);

        assert_eq!(added_fields(&existing, &merged), vec!["email", "age"]);
    }

    #[test]
    fn test_evolve_is_identity_on_itself() {
        let cases = [
            schema(&[]),
            schema(&[("a", DataType::Int64, false)]),
            schema(&[
                ("a", DataType::Int64, true),
                ("b", DataType::Utf8, false),
                ("c", DataType::Boolean, true),
            ]),
        ];
        for case in cases {
            assert_eq!(evolve(&case, &case), case);
            assert!(added_fields(&case, &case).is_empty());
        }
    }

    #[test]
    fn test_evolve_is_case_sensitive_and_keeps_first_duplicate() {
        let existing = schema(&[("id", DataType::Int64, true)]);
        let incoming = schema(&[
            ("ID", DataType::Utf8, true),
            ("x", DataType::Int64, true),
        ]);
        let incoming = Schema::new(
            incoming
                .fields()
                .iter()
                .cloned()
                .chain(std::iter::once(Arc::new(Field::new("x", DataType::Utf8, true))))
                .collect::<Vec<_>>(),
        );

        let merged = evolve(&existing, &incoming);
        assert_eq!(names(&merged), vec!["id", "ID", "x"]);
        assert_eq!(merged.field(2).data_type(), &DataType::Int64);
    }

    #[test]
    fn test_evolve_keeps_existing_metadata() {
        let mut metadata = std::collections::HashMap::new();
        let _ = metadata.insert("origin".to_string(), "sensor".to_string());
        let existing = schema(&[("a", DataType::Int64, true)]).with_metadata(metadata.clone());
        let merged = evolve(&existing, &schema(&[("b", DataType::Utf8, true)]));
        assert_eq!(merged.metadata(), &metadata);
    }

    #[test]
    fn test_conform_fills_missing_and_casts() {
        let incoming = Arc::new(schema(&[
            ("name", DataType::Utf8, true),
            ("id", DataType::Int64, true),
        ]));
        let batch = RecordBatch::try_new(
            incoming,
            vec![
                Arc::new(StringArray::from(vec!["a", "b"])),
                Arc::new(Int64Array::from(vec![1, 2])),
            ],
        )
        .unwrap();

        let target = Arc::new(schema(&[
            ("id", DataType::Utf8, true),
            ("name", DataType::Utf8, true),
            ("email", DataType::Utf8, true),
        ]));
        let out = conform(&batch, &target).unwrap();

        assert_eq!(out.schema(), target);
        assert_eq!(out.num_rows(), 2);
        let ids = out.column(0).as_any().downcast_ref::<StringArray>().unwrap();
        assert_eq!(ids.value(1), "2");
        assert_eq!(out.column(2).null_count(), 2);
    }

    #[test]
    fn test_conform_rejects_lossy_values() {
        let batch = RecordBatch::try_new(
            Arc::new(schema(&[("id", DataType::Utf8, true)])),
            vec![Arc::new(StringArray::from(vec!["7", "seven"]))],
        )
        .unwrap();
        let target = Arc::new(schema(&[("id", DataType::Int64, true)]));

        let err = conform(&batch, &target).unwrap_err();
        match err {
            CompactorError::SchemaConflict { field, existing, .. } => {
                assert_eq!(field, "id");
                assert_eq!(existing, "Int64");
            }
            other => panic!("unexpected error {other}"),
        }
    }

    #[test]
    fn test_conform_rejects_truncating_cast() {
        let batch = RecordBatch::try_new(
            Arc::new(schema(&[("id", DataType::Float64, true)])),
            vec![Arc::new(Float64Array::from(vec![1.0, 2.75]))],
        )
        .unwrap();
        let target = Arc::new(schema(&[("id", DataType::Int64, true)]));

        let err = conform(&batch, &target).unwrap_err();
        assert!(matches!(err, CompactorError::SchemaConflict { field, .. } if field == "id"));

        // Whole numbers convert cleanly
        let whole = RecordBatch::try_new(
            Arc::new(schema(&[("id", DataType::Float64, true)])),
            vec![Arc::new(Float64Array::from(vec![Some(1.0), None, Some(-4.0)]))],
        )
        .unwrap();
        let out = conform(&whole, &target).unwrap();
        let ids = out.column(0).as_any().downcast_ref::<Int64Array>().unwrap();
        assert_eq!(ids.value(0), 1);
        assert!(ids.is_null(1));
        assert_eq!(ids.value(2), -4);
    }

    #[test]
    fn test_conform_rejects_nulls_in_required_column() {
        let batch = RecordBatch::try_new(
            Arc::new(schema(&[("name", DataType::Utf8, true)])),
            vec![Arc::new(StringArray::from(vec!["a"]))],
        )
        .unwrap();
        let target = Arc::new(schema(&[
            ("id", DataType::Int64, false),
            ("name", DataType::Utf8, true),
        ]));

        let err = conform(&batch, &target).unwrap_err();
        assert!(matches!(err, CompactorError::SchemaConflict { field, .. } if field == "id"));
    }
}
