use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use sqlx::Row;

use super::*;
use crate::backend::MemBackend;
use crate::database::schema;
use crate::test_util::TempDir;

async fn setup(dir: &TempDir, config: Option<CacheConfig>) -> (BlockCache, Arc<MemBackend>, MetaDb) {
    let db = MetaDb::create(dir.path().join("meta.db")).await.unwrap();
    let mut conn = db.acquire().await.unwrap();
    schema::create_tables(&mut conn).await.unwrap();
    schema::create_indices(&mut conn).await.unwrap();
    drop(conn);

    let backend = Arc::new(MemBackend::new());
    let config = config.unwrap_or_else(|| CacheConfig {
        cachedir: dir.path().join("cache"),
        download_retry: Duration::from_millis(200),
        ..CacheConfig::default()
    });
    let cache = BlockCache::new(
        backend.clone(),
        db.clone(),
        config,
        Arc::new(AtomicBool::new(false)),
    )
    .unwrap();
    (cache, backend, db)
}

async fn write_block(cache: &BlockCache, inode: i64, blockno: u64, data: &[u8]) {
    cache
        .with_entry(inode, blockno, |entry| entry.write_at(0, data))
        .await
        .unwrap();
}

async fn read_block(cache: &BlockCache, inode: i64, blockno: u64, len: usize) -> Vec<u8> {
    cache
        .with_entry(inode, blockno, |entry| {
            let mut buf = vec![0u8; len];
            let n = entry.read_at(0, &mut buf)?;
            buf.truncate(n);
            Ok(buf)
        })
        .await
        .unwrap()
}

async fn count(db: &MetaDb, sql: &str) -> i64 {
    let mut conn = db.acquire().await.unwrap();
    sqlx::query(sql)
        .fetch_one(&mut *conn)
        .await
        .unwrap()
        .get::<i64, _>(0)
}

#[tokio::test]
async fn test_write_read_back() {
    let dir = TempDir::new("cache-rw");
    let (cache, _, _) = setup(&dir, None).await;

    write_block(&cache, 4, 0, b"some block content").await;
    assert_eq!(read_block(&cache, 4, 0, 64).await, b"some block content");
}

#[tokio::test]
async fn test_flush_uploads_and_commits() {
    let dir = TempDir::new("cache-flush");
    let (cache, backend, db) = setup(&dir, None).await;

    write_block(&cache, 4, 0, b"payload").await;
    assert_eq!(backend.object_count(), 0);

    cache.flush(4).await.unwrap();
    assert_eq!(backend.object_count(), 1);
    assert_eq!(backend.raw_get("data_1").unwrap(), b"payload");
    assert_eq!(count(&db, "SELECT COUNT(*) FROM objects").await, 1);
    assert_eq!(count(&db, "SELECT COUNT(*) FROM blocks").await, 1);
    assert_eq!(count(&db, "SELECT COUNT(*) FROM inode_blocks").await, 1);
    assert_eq!(
        count(&db, "SELECT compr_size FROM objects WHERE id = 1").await,
        b"payload".len() as i64
    );

    // A clean entry is not re-uploaded.
    cache.flush(4).await.unwrap();
    assert_eq!(backend.object_count(), 1);
}

#[tokio::test]
async fn test_dedup_identical_content_shares_object() {
    let dir = TempDir::new("cache-dedup");
    let (cache, backend, db) = setup(&dir, None).await;

    write_block(&cache, 4, 0, b"identical bytes").await;
    write_block(&cache, 5, 0, b"identical bytes").await;
    cache.flush_all().await.unwrap();

    // One object, one block, two mappings.
    assert_eq!(backend.object_count(), 1);
    assert_eq!(count(&db, "SELECT COUNT(*) FROM objects").await, 1);
    assert_eq!(count(&db, "SELECT refcount FROM blocks WHERE id = 1").await, 2);
    assert_eq!(count(&db, "SELECT COUNT(*) FROM inode_blocks").await, 2);

    // Removing one mapping keeps the object alive.
    cache.remove(5, 0).await.unwrap();
    assert_eq!(backend.object_count(), 1);
    assert_eq!(count(&db, "SELECT refcount FROM blocks WHERE id = 1").await, 1);

    // Removing the last mapping deletes it.
    cache.remove(4, 0).await.unwrap();
    assert_eq!(backend.object_count(), 0);
    assert_eq!(count(&db, "SELECT COUNT(*) FROM blocks").await, 0);
    assert_eq!(count(&db, "SELECT COUNT(*) FROM objects").await, 0);
}

#[tokio::test]
async fn test_rewrite_collects_orphaned_object() {
    let dir = TempDir::new("cache-rewrite");
    let (cache, backend, db) = setup(&dir, None).await;

    write_block(&cache, 4, 0, b"first version").await;
    cache.flush(4).await.unwrap();
    assert_eq!(backend.object_count(), 1);

    write_block(&cache, 4, 0, b"second version").await;
    cache.flush(4).await.unwrap();

    // The first object lost its last reference and was deleted.
    assert_eq!(backend.object_count(), 1);
    assert_eq!(count(&db, "SELECT COUNT(*) FROM objects").await, 1);
    assert_eq!(read_block(&cache, 4, 0, 64).await, b"second version");
}

#[tokio::test]
async fn test_eviction_respects_entry_bound() {
    let dir = TempDir::new("cache-evict");
    let config = CacheConfig {
        cachedir: dir.path().join("cache"),
        max_entries: 4,
        download_retry: Duration::from_millis(200),
        ..CacheConfig::default()
    };
    let (cache, backend, _) = setup(&dir, Some(config)).await;

    for blockno in 0..10u64 {
        write_block(&cache, 4, blockno, format!("block {}", blockno).as_bytes()).await;
    }
    assert!(cache.len() <= 4, "cache holds {} entries", cache.len());
    // Evicted dirty entries were uploaded on the way out.
    assert!(backend.object_count() >= 6);

    // Evicted blocks are transparently re-downloaded.
    assert_eq!(read_block(&cache, 4, 0, 64).await, b"block 0");
}

#[tokio::test]
async fn test_eviction_respects_size_bound() {
    let dir = TempDir::new("cache-evict-size");
    let config = CacheConfig {
        cachedir: dir.path().join("cache"),
        max_size: 4096,
        download_retry: Duration::from_millis(200),
        ..CacheConfig::default()
    };
    let (cache, _, _) = setup(&dir, Some(config)).await;

    for blockno in 0..8u64 {
        write_block(&cache, 4, blockno, &vec![blockno as u8; 1024]).await;
    }
    assert!(cache.cache_bytes() <= 4096);
}

#[tokio::test]
async fn test_remove_from_blockno_onwards() {
    let dir = TempDir::new("cache-remove-tail");
    let (cache, backend, db) = setup(&dir, None).await;

    for blockno in 0..5u64 {
        write_block(&cache, 4, blockno, format!("tail {}", blockno).as_bytes()).await;
    }
    cache.flush_all().await.unwrap();
    assert_eq!(backend.object_count(), 5);

    cache.remove(4, 2).await.unwrap();
    assert_eq!(count(&db, "SELECT COUNT(*) FROM inode_blocks").await, 2);
    assert_eq!(backend.object_count(), 2);
}

#[tokio::test]
async fn test_hole_reads_empty_entry() {
    let dir = TempDir::new("cache-hole");
    let (cache, _, db) = setup(&dir, None).await;

    // A block that was never written produces an empty entry and no
    // database rows.
    let data = read_block(&cache, 4, 7, 32).await;
    assert!(data.is_empty());
    assert_eq!(count(&db, "SELECT COUNT(*) FROM inode_blocks").await, 0);

    // Flushing it creates rows lazily only once something is written.
    cache.flush(4).await.unwrap();
    assert_eq!(count(&db, "SELECT COUNT(*) FROM inode_blocks").await, 0);
}

#[tokio::test]
async fn test_download_waits_for_eventual_consistency() {
    let dir = TempDir::new("cache-eventual");
    let db = MetaDb::create(dir.path().join("meta.db")).await.unwrap();
    let mut conn = db.acquire().await.unwrap();
    schema::create_tables(&mut conn).await.unwrap();
    drop(conn);

    let backend = Arc::new(MemBackend::eventually_consistent(Duration::from_millis(80)));
    let config = CacheConfig {
        cachedir: dir.path().join("cache"),
        download_retry: Duration::from_secs(5),
        ..CacheConfig::default()
    };
    let cache = BlockCache::new(
        backend.clone(),
        db.clone(),
        config,
        Arc::new(AtomicBool::new(false)),
    )
    .unwrap();

    write_block(&cache, 4, 0, b"slowly visible").await;
    cache.flush(4).await.unwrap();
    // Force the entry out so the next read must download while the
    // object is still propagating.
    cache.clear().await.unwrap();

    assert_eq!(read_block(&cache, 4, 0, 64).await, b"slowly visible");
}

#[tokio::test]
async fn test_missing_object_marks_damaged() {
    let dir = TempDir::new("cache-damaged");
    let db = MetaDb::create(dir.path().join("meta.db")).await.unwrap();
    let mut conn = db.acquire().await.unwrap();
    schema::create_tables(&mut conn).await.unwrap();
    drop(conn);

    let backend = Arc::new(MemBackend::new());
    let damaged = Arc::new(AtomicBool::new(false));
    let config = CacheConfig {
        cachedir: dir.path().join("cache"),
        download_retry: Duration::from_millis(50),
        ..CacheConfig::default()
    };
    let cache = BlockCache::new(backend.clone(), db.clone(), config, damaged.clone()).unwrap();

    write_block(&cache, 4, 0, b"doomed").await;
    cache.clear().await.unwrap();

    // Lose the object behind the cache's back.
    backend.delete("data_1", false).await.unwrap();

    let err = cache
        .with_entry(4, 0, |entry| {
            let mut buf = [0u8; 8];
            entry.read_at(0, &mut buf).map(|_| ())
        })
        .await
        .unwrap_err();
    assert!(matches!(err, CacheError::LostBlock { .. }));
    assert!(damaged.load(Ordering::SeqCst));
}

#[tokio::test]
async fn test_recover_registers_stale_files_as_dirty() {
    let dir = TempDir::new("cache-recover");
    let (cache, backend, _) = setup(&dir, None).await;

    // A cache file left behind by a crashed mount.
    std::fs::write(
        dir.path().join("cache").join("inode_9_block_0"),
        b"survived the crash",
    )
    .unwrap();

    cache.recover().await.unwrap();
    assert_eq!(cache.len(), 1);

    cache.flush_all().await.unwrap();
    assert_eq!(backend.object_count(), 1);
    assert_eq!(backend.raw_get("data_1").unwrap(), b"survived the crash");
}

#[tokio::test]
async fn test_recover_rejects_foreign_files() {
    let dir = TempDir::new("cache-recover-foreign");
    let (cache, _, _) = setup(&dir, None).await;

    std::fs::write(dir.path().join("cache").join("stray.bin"), b"?").unwrap();
    assert!(cache.recover().await.is_err());
}

#[tokio::test]
async fn test_clear_drains_everything() {
    let dir = TempDir::new("cache-clear");
    let (cache, backend, _) = setup(&dir, None).await;

    for blockno in 0..6u64 {
        write_block(&cache, 4, blockno, format!("c{}", blockno).as_bytes()).await;
    }
    cache.clear().await.unwrap();

    assert_eq!(cache.len(), 0);
    assert_eq!(cache.cache_bytes(), 0);
    assert_eq!(backend.object_count(), 6);
    assert!(std::fs::read_dir(dir.path().join("cache")).unwrap().next().is_none());
}

#[tokio::test]
async fn test_wait_in_transit_returns_when_clear() {
    let dir = TempDir::new("cache-transit");
    let (cache, _, _) = setup(&dir, None).await;

    let mut keys = HashSet::new();
    keys.insert((4i64, 0u64));
    // Nothing is uploading, so this must not block.
    tokio::time::timeout(Duration::from_millis(100), cache.wait_in_transit(&keys))
        .await
        .unwrap();
}

#[tokio::test]
async fn test_concurrent_writers_distinct_blocks() {
    let dir = TempDir::new("cache-concurrent");
    let (cache, backend, db) = setup(&dir, None).await;
    let cache = Arc::new(cache);

    let mut handles = Vec::new();
    for blockno in 0..8u64 {
        let cache = Arc::clone(&cache);
        handles.push(tokio::spawn(async move {
            cache
                .with_entry(4, blockno, |entry| {
                    entry.write_at(0, format!("writer {}", blockno).as_bytes())
                })
                .await
                .unwrap();
        }));
    }
    for handle in handles {
        handle.await.unwrap();
    }
    cache.flush_all().await.unwrap();

    // Every block was committed exactly once.
    assert_eq!(count(&db, "SELECT COUNT(*) FROM inode_blocks").await, 8);
    assert_eq!(backend.object_count(), 8);
    for blockno in 0..8u64 {
        assert_eq!(
            read_block(&cache, 4, blockno, 64).await,
            format!("writer {}", blockno).as_bytes()
        );
    }
}
