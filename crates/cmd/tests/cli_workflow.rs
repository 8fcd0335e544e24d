use std::path::Path;
use std::sync::Arc;

use anyhow::Result;
use blobfs::{BlobStore, MemoryBlobStore};
use cmd::commands::{CompactArgs, append_command, cat_command, compact_command, schema_command};
use cmd::common::{StoreContext, open_directory};
use compactor::{BufpondConfig, CancellationToken};
use tempfile::tempdir;

fn write_config(dir: &Path) -> Result<std::path::PathBuf> {
    let root = dir.join("store");
    std::fs::create_dir_all(&root)?;
    let root = root.canonicalize()?;
    let yaml = format!(
        "stores:\n  default:\n    url: \"file://{}\"\n  scratch:\n    url: \"memory://\"\nresilience:\n  mutation:\n    max_attempts: 3\n    min_delay_ms: 1\n    max_delay_ms: 5\n",
        root.display()
    );
    let path = dir.join("bufpond.yaml");
    std::fs::write(&path, yaml)?;
    Ok(path)
}

fn records(lines: &[&str]) -> Vec<String> {
    lines.iter().map(|l| l.to_string()).collect()
}

#[tokio::test]
async fn test_append_compact_inspect() -> Result<()> {
    let tmp = tempdir()?;
    let config = write_config(tmp.path())?;
    let ctx = StoreContext::open(Some(&config), None)?;
    let cancel = CancellationToken::new();

    let out = append_command(
        &ctx,
        "events.buf",
        &records(&[r#"{"id": 1, "name": "alice"}"#, r#"{"id": 2, "name": "bob"}"#]),
        &cancel,
    )
    .await?;
    assert!(out.contains("Appended 2 records"), "{out}");

    let out = compact_command(&ctx, &CompactArgs::new("events.buf", "events.parquet"), &cancel)
        .await?;
    assert!(out.contains("2 rows appended, 2 total"), "{out}");
    assert!(out.contains("new fields:"), "{out}");

    let out = schema_command(&ctx, "events.parquet").await?;
    assert!(out.contains("id: Int64"), "{out}");
    assert!(out.contains("name: Utf8"), "{out}");

    let out = cat_command(&ctx, "events.parquet").await?;
    assert!(out.contains("alice"), "{out}");
    assert!(out.contains("bob"), "{out}");

    // Second pass widens the schema
    append_command(
        &ctx,
        "events.buf",
        &records(&[r#"{"id": 3, "name": "carol", "email": "c@example.com"}"#]),
        &cancel,
    )
    .await?;
    let out = compact_command(&ctx, &CompactArgs::new("events.buf", "events.parquet"), &cancel)
        .await?;
    assert!(out.contains("1 rows appended, 3 total"), "{out}");
    assert!(out.contains("new fields: email"), "{out}");

    let out = schema_command(&ctx, "events.parquet").await?;
    assert!(out.contains("email: Utf8"), "{out}");
    Ok(())
}

#[tokio::test]
async fn test_compact_without_buffer() -> Result<()> {
    let tmp = tempdir()?;
    let config = write_config(tmp.path())?;
    let ctx = StoreContext::open(Some(&config), Some("scratch"))?;

    let out = compact_command(
        &ctx,
        &CompactArgs::new("missing.buf", "missing.parquet"),
        &CancellationToken::new(),
    )
    .await?;
    assert!(out.contains("Nothing to compact in missing.buf"), "{out}");
    Ok(())
}

#[tokio::test]
async fn test_blank_records_rejected() -> Result<()> {
    let store: Arc<dyn BlobStore> = Arc::new(MemoryBlobStore::new());
    let ctx = StoreContext::with_store(store.clone(), BufpondConfig::default());

    let err = append_command(&ctx, "a.buf", &records(&["", "   "]), &CancellationToken::new())
        .await
        .unwrap_err();
    assert!(err.to_string().contains("No records"));
    assert!(!store.exists("a.buf").await?);
    Ok(())
}

#[tokio::test]
async fn test_split_record_leaves_buffer_alone() -> Result<()> {
    let store: Arc<dyn BlobStore> = Arc::new(MemoryBlobStore::new());
    let ctx = StoreContext::with_store(store.clone(), BufpondConfig::default());

    let result = append_command(
        &ctx,
        "a.buf",
        &records(&[r#"{"id": 1}"#, "{\"id\":\n2}"]),
        &CancellationToken::new(),
    )
    .await;
    assert!(result.is_err());
    assert!(!store.exists("a.buf").await?);
    Ok(())
}

#[tokio::test]
async fn test_unknown_store_rejected() -> Result<()> {
    let tmp = tempdir()?;
    let config = write_config(tmp.path())?;
    let err = StoreContext::open(Some(&config), Some("nowhere")).unwrap_err();
    assert!(err.to_string().contains("nowhere"));
    Ok(())
}

#[tokio::test]
async fn test_schema_of_non_columnar_object() -> Result<()> {
    let tmp = tempdir()?;
    let store = open_directory(&tmp.path().join("store"))?;
    store.upload("notes.txt", "hello, world".into()).await?;
    let ctx = StoreContext::with_store(store, BufpondConfig::default());

    let err = schema_command(&ctx, "notes.txt").await.unwrap_err();
    assert!(err.to_string().contains("not a readable columnar file"));

    assert!(cat_command(&ctx, "absent.parquet").await.is_err());
    Ok(())
}
