use blobfs::{BlobStore, MemoryBlobStore, ObjectBlobStore};
use bytes::Bytes;
use object_store::memory::InMemory;
use std::sync::Arc;

type TestResult<T> = Result<T, Box<dyn std::error::Error>>;

/// The behaviour every backend must share
async fn check_contract(store: &dyn BlobStore) -> TestResult<()> {
    assert!(!store.exists("logs/app.jsonl").await?);
    assert!(store.get_length("logs/app.jsonl").await.unwrap_err().is_not_found());

    store.create_empty("logs/app.jsonl").await?;
    assert!(store.exists("logs/app.jsonl").await?);
    assert_eq!(store.get_length("logs/app.jsonl").await?, 0);
    assert!(store.create_empty("logs/app.jsonl").await.unwrap_err().is_already_exists());

    let first = Bytes::from_static(b"{\"id\":1}\n");
    let second = Bytes::from_static(b"{\"id\":2}\n");
    store.append("logs/app.jsonl", first.clone(), 0).await?;
    store.commit("logs/app.jsonl", first.len() as u64).await?;
    store
        .append("logs/app.jsonl", second.clone(), first.len() as u64)
        .await?;
    store
        .commit("logs/app.jsonl", (first.len() + second.len()) as u64)
        .await?;
    assert_eq!(
        store.read_all("logs/app.jsonl").await?,
        Bytes::from_static(b"{\"id\":1}\n{\"id\":2}\n")
    );

    store
        .rename("logs/app.jsonl", "logs/app.jsonl.compacting.1")
        .await?;
    assert!(!store.exists("logs/app.jsonl").await?);
    let err = store
        .append("logs/app.jsonl", Bytes::from_static(b"x\n"), 18)
        .await
        .unwrap_err();
    assert!(err.is_not_found());

    store.create_empty("logs/app.jsonl").await?;
    let err = store
        .rename("logs/app.jsonl", "logs/app.jsonl.compacting.1")
        .await
        .unwrap_err();
    assert!(err.is_already_exists());

    store.upload("logs/app.parquet", Bytes::from_static(b"PAR1....PAR1")).await?;
    assert_eq!(store.get_length("logs/app.parquet").await?, 12);

    store.delete("logs/app.jsonl.compacting.1").await?;
    store.delete("logs/app.jsonl.compacting.1").await?;
    assert!(!store.exists("logs/app.jsonl.compacting.1").await?);
    Ok(())
}

#[tokio::test]
async fn test_memory_backend_contract() -> TestResult<()> {
    check_contract(&MemoryBlobStore::new()).await
}

#[tokio::test]
async fn test_object_store_backend_contract() -> TestResult<()> {
    check_contract(&ObjectBlobStore::new(Arc::new(InMemory::new()))).await
}

#[tokio::test]
async fn test_local_filesystem_backend_contract() -> TestResult<()> {
    let dir = tempfile::tempdir()?;
    let store = ObjectBlobStore::from_url(&format!("file://{}", dir.path().display()))?;
    check_contract(&store).await
}
