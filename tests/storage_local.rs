#![allow(missing_docs)]

use std::time::Duration;

use bytes::Bytes;
use futures::{stream, TryStreamExt};
use stowage::storage::signing::{SignedMethod, SignedParams};
use stowage::{
    BackendDescriptor, ByteStream, CompletedPart, LocalStorage, ProviderKind, StorageBackend,
    StorageError,
};
use tempfile::TempDir;

fn local(root: &TempDir) -> LocalStorage {
    LocalStorage::builder()
        .name("disk")
        .root(root.path())
        .public_url("https://files.example.com/f/")
        .signing_secret("test-secret")
        .build()
        .expect("builder should succeed")
}

fn chunks(parts: &[&'static str]) -> ByteStream<'static> {
    let items: Vec<Result<Bytes, StorageError>> = parts
        .iter()
        .map(|part| Ok(Bytes::from_static(part.as_bytes())))
        .collect();
    Box::pin(stream::iter(items))
}

fn parse_query(url: &str) -> SignedParams {
    let (_, query) = url.split_once('?').expect("signed url has a query");
    let mut expires = None;
    let mut max_size = None;
    let mut signature = None;
    for pair in query.split('&') {
        let (name, value) = pair.split_once('=').expect("query pair");
        match name {
            "expires" => expires = Some(value.parse().expect("numeric expiry")),
            "max_size" => max_size = Some(value.parse().expect("numeric size")),
            "signature" => signature = Some(value.to_owned()),
            other => panic!("unexpected query parameter {other}"),
        }
    }
    SignedParams {
        expires: expires.expect("expires present"),
        max_size,
        signature: signature.expect("signature present"),
    }
}

#[tokio::test]
async fn upload_then_size_and_download_round_trip() {
    let root = TempDir::new().expect("temp dir");
    let storage = local(&root);

    storage
        .upload("a/b.txt", Bytes::from_static(b"hello"))
        .await
        .expect("upload should succeed");

    assert_eq!(storage.size("a/b.txt").await.expect("size"), 5);
    assert_eq!(
        storage.download("a/b.txt").await.expect("download"),
        Bytes::from_static(b"hello")
    );
    assert!(storage.exists("a/b.txt").await.expect("exists"));
    assert_eq!(
        tokio::fs::read(root.path().join("a").join("b.txt"))
            .await
            .expect("file on disk"),
        b"hello"
    );
}

#[tokio::test]
async fn upload_replaces_existing_object() {
    let root = TempDir::new().expect("temp dir");
    let storage = local(&root);

    storage.upload("k", Bytes::from_static(b"first")).await.expect("first upload");
    storage.upload("k", Bytes::from_static(b"2nd")).await.expect("second upload");

    assert_eq!(storage.download("k").await.expect("download"), Bytes::from_static(b"2nd"));
}

#[tokio::test]
async fn delete_is_idempotent() {
    let root = TempDir::new().expect("temp dir");
    let storage = local(&root);

    storage.upload("gone.txt", Bytes::from_static(b"x")).await.expect("upload");
    storage.delete("gone.txt").await.expect("first delete");
    storage.delete("gone.txt").await.expect("second delete");

    assert!(!storage.exists("gone.txt").await.expect("exists"));
    let err = storage.download("gone.txt").await.expect_err("object is gone");
    assert!(matches!(err, StorageError::NotFound { ref key } if key == "gone.txt"));
    assert!(storage.size("gone.txt").await.expect_err("no size").is_not_found());
}

#[tokio::test]
async fn stream_upload_and_download() {
    let root = TempDir::new().expect("temp dir");
    let storage = local(&root);

    storage
        .upload_stream("s/chunked.bin", chunks(&["ab", "cd", "ef"]), 6)
        .await
        .expect("stream upload");

    let downloaded: Vec<Bytes> = storage
        .download_stream("s/chunked.bin")
        .await
        .expect("open stream")
        .try_collect()
        .await
        .expect("read stream");
    assert_eq!(downloaded.concat(), b"abcdef");
}

#[tokio::test]
async fn stream_upload_with_wrong_size_leaves_nothing_behind() {
    let root = TempDir::new().expect("temp dir");
    let storage = local(&root);

    let short = storage
        .upload_stream("short.bin", chunks(&["abc"]), 10)
        .await
        .expect_err("short stream");
    assert!(matches!(
        short,
        StorageError::SizeMismatch { expected: 10, actual: 3, .. }
    ));

    let long = storage
        .upload_stream("long.bin", chunks(&["abc", "def"]), 4)
        .await
        .expect_err("long stream");
    assert!(matches!(long, StorageError::SizeMismatch { expected: 4, .. }));

    assert!(!storage.exists("short.bin").await.expect("exists"));
    assert!(!storage.exists("long.bin").await.expect("exists"));
    assert_eq!(storage.stats().await.expect("stats").object_count, 0);
}

#[tokio::test]
async fn rejects_unsafe_keys() {
    let root = TempDir::new().expect("temp dir");
    let storage = local(&root);

    for key in ["", "/etc/passwd", "../escape.txt", "a/../../b", ".multipart/x", ".staging/y"] {
        let err = storage
            .upload(key, Bytes::from_static(b"x"))
            .await
            .expect_err("key must be rejected");
        assert!(matches!(err, StorageError::InvalidKey { .. }), "{key:?}: {err}");
    }
}

#[tokio::test]
async fn copy_and_rename() {
    let root = TempDir::new().expect("temp dir");
    let storage = local(&root);
    storage.upload("src.txt", Bytes::from_static(b"data")).await.expect("upload");

    storage.copy("src.txt", "copies/dst.txt").await.expect("copy");
    assert_eq!(storage.download("copies/dst.txt").await.expect("copy readable"), "data");
    assert!(storage.exists("src.txt").await.expect("exists"));

    storage.rename("src.txt", "moved/src.txt").await.expect("rename");
    assert!(!storage.exists("src.txt").await.expect("exists"));
    assert_eq!(storage.download("moved/src.txt").await.expect("moved readable"), "data");

    let err = storage.rename("missing.txt", "x.txt").await.expect_err("missing source");
    assert!(err.is_not_found());
    let err = storage.copy("missing.txt", "x.txt").await.expect_err("missing source");
    assert!(err.is_not_found());
}

#[tokio::test]
async fn delete_many_skips_missing_keys() {
    let root = TempDir::new().expect("temp dir");
    let storage = local(&root);
    storage.upload("one", Bytes::from_static(b"1")).await.expect("upload");
    storage.upload("two", Bytes::from_static(b"2")).await.expect("upload");

    storage
        .delete_many(&["one".to_owned(), "never-existed".to_owned(), "two".to_owned()])
        .await
        .expect("batch delete");

    assert_eq!(storage.stats().await.expect("stats").object_count, 0);
}

#[tokio::test]
async fn stats_ignore_multipart_parts() {
    let root = TempDir::new().expect("temp dir");
    let storage = local(&root);
    storage.upload("x/a.txt", Bytes::from_static(b"hello")).await.expect("upload");
    storage.upload("y/z/b.txt", Bytes::from_static(b"abc")).await.expect("upload");

    let upload = storage.initiate_multipart("pending.bin").await.expect("initiate");
    storage
        .upload_part(&upload.upload_id, "pending.bin", 1, Bytes::from_static(b"partial"))
        .await
        .expect("part");

    let stats = storage.stats().await.expect("stats");
    assert_eq!(stats.object_count, 2);
    assert_eq!(stats.total_size, 8);
}

#[tokio::test]
async fn health_check_leaves_no_marker() {
    let root = TempDir::new().expect("temp dir");
    let storage = local(&root);

    storage.health_check().await.expect("healthy");
    storage.health_check().await.expect("still healthy");
    assert_eq!(storage.stats().await.expect("stats").object_count, 0);
}

#[tokio::test]
async fn health_check_fails_when_root_is_unusable() {
    let root = TempDir::new().expect("temp dir");
    let blocker = root.path().join("not-a-dir");
    tokio::fs::write(&blocker, b"file").await.expect("write blocker");

    let storage = LocalStorage::builder().root(&blocker).build().expect("builder");
    let err = storage.health_check().await.expect_err("root is a file");
    assert!(matches!(err, StorageError::Provider { ref code, .. } if code == "HealthCheckFailed"));
}

#[tokio::test]
async fn public_and_presigned_urls() {
    let root = TempDir::new().expect("temp dir");
    let storage = local(&root);

    assert_eq!(
        storage.url("dir/my file.txt").await.expect("url"),
        "https://files.example.com/f/dir/my%20file.txt"
    );

    let download = storage
        .presigned_url("dir/my file.txt", Duration::from_secs(300))
        .await
        .expect("presign download");
    assert!(download.starts_with("https://files.example.com/f/dir/my%20file.txt?expires="));
    let params = parse_query(&download);
    assert!(storage.verify_presigned(SignedMethod::Get, "dir/my file.txt", &params));
    assert!(!storage.verify_presigned(SignedMethod::Put, "dir/my file.txt", &params));

    let upload = storage
        .presigned_upload_url("in/new.bin", Duration::from_secs(60), 1024)
        .await
        .expect("presign upload");
    let mut params = parse_query(&upload);
    assert_eq!(params.max_size, Some(1024));
    assert!(storage.verify_presigned(SignedMethod::Put, "in/new.bin", &params));

    params.max_size = Some(1 << 30);
    assert!(!storage.verify_presigned(SignedMethod::Put, "in/new.bin", &params));
}

#[tokio::test]
async fn local_multipart_assembles_by_part_number() {
    let root = TempDir::new().expect("temp dir");
    let storage = local(&root);

    let upload = storage.initiate_multipart("big.bin").await.expect("initiate");
    assert_eq!(upload.provider, "disk");
    let second = storage
        .upload_part(&upload.upload_id, "big.bin", 2, Bytes::from_static(b"BBBB"))
        .await
        .expect("part 2");
    let first = storage
        .upload_part(&upload.upload_id, "big.bin", 1, Bytes::from_static(b"AAAA"))
        .await
        .expect("part 1");
    assert_eq!(first.etag, "1_4");
    assert_eq!(second.etag, "2_4");

    let manifest = [CompletedPart::from(&second), CompletedPart::from(&first)];
    storage
        .complete_multipart(&upload.upload_id, "big.bin", &manifest)
        .await
        .expect("complete");

    assert_eq!(storage.download("big.bin").await.expect("download"), "AAAABBBB");
    let err = storage
        .abort_multipart(&upload.upload_id, "big.bin")
        .await
        .expect_err("session is finished");
    assert!(matches!(err, StorageError::UploadNotFound { .. }));
}

#[tokio::test]
async fn local_multipart_unknown_upload_id() {
    let root = TempDir::new().expect("temp dir");
    let storage = local(&root);

    for upload_id in ["not-a-uuid", "3f2504e0-4f89-11d3-9a0c-0305e82c3301"] {
        let err = storage
            .upload_part(upload_id, "k", 1, Bytes::from_static(b"x"))
            .await
            .expect_err("unknown upload");
        assert!(err.is_not_found(), "{upload_id}: {err}");
    }
}

#[tokio::test]
async fn local_multipart_rejects_part_zero() {
    let root = TempDir::new().expect("temp dir");
    let storage = local(&root);
    let upload = storage.initiate_multipart("k.bin").await.expect("initiate");

    let err = storage
        .upload_part(&upload.upload_id, "k.bin", 0, Bytes::from_static(b"x"))
        .await
        .expect_err("part numbers start at 1");
    assert!(matches!(err, StorageError::InvalidPartNumber { part_number: 0, .. }));
}

#[tokio::test]
async fn failed_completion_leaves_only_parts_in_the_session() {
    let root = TempDir::new().expect("temp dir");
    let storage = local(&root);
    storage
        .upload("blocked", Bytes::from_static(b"a regular file"))
        .await
        .expect("upload");

    let upload = storage.initiate_multipart("blocked/x.bin").await.expect("initiate");
    let part = storage
        .upload_part(&upload.upload_id, "blocked/x.bin", 1, Bytes::from_static(b"AAAA"))
        .await
        .expect("part 1");
    storage
        .complete_multipart(&upload.upload_id, "blocked/x.bin", &[CompletedPart::from(&part)])
        .await
        .expect_err("parent path is a file");

    let sessions: Vec<_> = std::fs::read_dir(root.path().join(".multipart"))
        .expect("multipart dir")
        .map(|entry| entry.expect("entry").path())
        .collect();
    assert_eq!(sessions.len(), 1);
    let mut files: Vec<String> = std::fs::read_dir(&sessions[0])
        .expect("session dir")
        .map(|entry| entry.expect("entry").file_name().to_string_lossy().into_owned())
        .collect();
    files.sort();
    assert_eq!(files, ["1.part"]);
}

#[tokio::test]
async fn opened_from_descriptor() {
    let root = TempDir::new().expect("temp dir");
    let descriptor = BackendDescriptor::local("primary", root.path())
        .with_setting("signing_secret", "s3cr3t");

    let backend = stowage::open(&descriptor).await.expect("open local backend");
    let info = backend.provider_info();
    assert_eq!(info.kind, ProviderKind::Local);
    assert_eq!(info.name, "primary");
    assert!(info.features.iter().any(|feature| feature == "multipart"));

    backend.upload("k.txt", Bytes::from_static(b"v")).await.expect("upload");
    assert_eq!(backend.url("k.txt").await.expect("url"), "/files/k.txt");
}
