mod common;

use std::time::Duration;

use common::{OWNER, TestStore};
use vstore::domain::{FolderProperties, ListOptions, ROOT_ID};
use vstore::{FsEntry, StorageError};

#[tokio::test]
async fn test_list_after_upload() {
    let store = TestStore::new().await;
    store.service.create_folder("/", "docs", OWNER).await.unwrap();
    let tmp = store.chunk(b"hello world");
    let file = store
        .service
        .upload_file("/docs", "a.txt", &tmp, 0, true, OWNER)
        .await
        .unwrap()
        .unwrap();
    assert!(file.is_complete());
    assert_eq!(file.extension.as_deref(), Some("txt"));

    let entries = store.service.list("/docs", ListOptions::default()).await.unwrap();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].name(), "a.txt");
    assert_eq!(entries[0].size(), std::fs::metadata(&tmp).unwrap().len());
}

#[tokio::test]
async fn test_exists_agrees_with_info() {
    let store = TestStore::new().await;
    store.mkdir("/", "docs").await;
    store.mkdir("/docs", "sub").await;
    store.put("/docs/sub", "x.bin", b"x").await;
    store.service.delete("/docs/sub/x.bin", false).await.unwrap();
    store.put("/docs", "y.bin", b"y").await;

    for path in [
        "/",
        "/docs",
        "/docs/",
        "/docs/sub",
        "/docs/sub/x.bin",
        "/docs/y.bin",
        "/nope",
        "/docs/nope/deeper",
    ] {
        let exists = store.service.exists(path).await.unwrap();
        let info = store.service.info(path).await;
        assert_eq!(exists, info.is_ok(), "{path}");
        if let Err(e) = info {
            assert!(e.is_not_found(), "{path}: {e}");
        }
    }
    match store.service.info("/").await.unwrap() {
        FsEntry::Folder(root) => assert_eq!(root.meta.id, ROOT_ID),
        other => panic!("unexpected {other:?}"),
    }
    assert!(matches!(
        store.service.exists("relative/path").await,
        Err(StorageError::InvalidPath(_))
    ));
}

#[tokio::test]
async fn test_create_folder_preconditions() {
    let store = TestStore::new().await;
    store.service.create_root("docs", OWNER).await.unwrap();
    store.put("/docs", "a.txt", b"a").await;

    let err = store.service.create_root("docs", OWNER).await.unwrap_err();
    assert!(matches!(err, StorageError::DestinyPathAlreadyExists(p) if p == "/docs"));
    let err = store.service.create_folder("/docs", "a.txt", OWNER).await.unwrap_err();
    assert!(matches!(err, StorageError::DestinyPathAlreadyExists(_)));
    let err = store.service.create_folder("/docs/a.txt", "x", OWNER).await.unwrap_err();
    assert!(matches!(err, StorageError::NotAFolder(_)));
    let err = store.service.create_folder("/missing", "x", OWNER).await.unwrap_err();
    assert!(err.is_not_found());
    let err = store.service.create_folder("/docs", "..", OWNER).await.unwrap_err();
    assert!(matches!(err, StorageError::InvalidPath(_)));
}

#[tokio::test]
async fn test_list_options() {
    let store = TestStore::with_page_size(2).await;
    store.mkdir("/", "r").await;
    for name in ["a.txt", "b.png", "c.txt", "d.jpg", "e.txt"] {
        store.put("/r", name, name.as_bytes()).await;
    }
    store.mkdir("/r", "sub").await;
    store.put("/r/sub", "f.txt", b"f").await;

    // default page size applies without limit_after
    assert_eq!(store.names("/r").await, vec!["a.txt", "b.png"]);

    let mut seen = Vec::new();
    let mut cursor = None;
    loop {
        let page = store
            .service
            .list(
                "/r",
                ListOptions {
                    cursor: cursor.clone(),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        let Some(last) = page.last() else { break };
        cursor = Some(last.path().to_string());
        seen.extend(page.iter().map(|e| e.name().to_string()));
    }
    assert_eq!(seen, vec!["a.txt", "b.png", "c.txt", "d.jpg", "e.txt", "sub"]);

    let txt = store
        .service
        .list(
            "/r",
            ListOptions {
                recursive: true,
                ignore_folders: true,
                ext_whitelist: vec![".TXT".into()],
                limit_after: Some(10),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    let paths: Vec<&str> = txt.iter().map(|e| e.path()).collect();
    assert_eq!(paths, vec!["/r/a.txt", "/r/c.txt", "/r/e.txt", "/r/sub/f.txt"]);

    let newest = store
        .service
        .list(
            "/r",
            ListOptions {
                sort_by: "updated_on".into(),
                desc: true,
                limit_after: Some(1),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    assert_eq!(newest[0].name(), "sub");

    let err = store
        .service
        .list(
            "/r",
            ListOptions {
                sort_by: "size".into(),
                ..Default::default()
            },
        )
        .await
        .unwrap_err();
    assert!(matches!(err, StorageError::Service { .. }));
    let err = store.service.list("/r/a.txt", ListOptions::default()).await.unwrap_err();
    assert!(matches!(err, StorageError::NotAFolder(_)));
    let err = store.service.list("/nope", ListOptions::default()).await.unwrap_err();
    assert!(err.is_not_found());
}

#[tokio::test]
async fn test_delete() {
    let store = TestStore::new().await;
    store.mkdir("/", "docs").await;
    store.mkdir("/docs", "sub").await;
    store.put("/docs/sub", "a.txt", b"a").await;

    store.service.delete("/docs/sub", false).await.unwrap();
    assert!(!store.service.exists("/docs/sub").await.unwrap());
    assert!(!store.service.exists("/docs/sub/a.txt").await.unwrap());
    assert!(store.names("/docs").await.is_empty());

    let err = store.service.delete("/docs/sub", true).await.unwrap_err();
    assert!(err.is_not_found());
    let err = store.service.delete("/", false).await.unwrap_err();
    assert!(matches!(err, StorageError::InvalidPath(_)));

    // the name is free again
    store.mkdir("/docs", "sub").await;

    // a deleted file takes its history with it
    store.put("/docs", "a.txt", b"v1").await;
    store.put("/docs", "a.txt", b"v2").await;
    assert_eq!(store.service.versions("/docs/a.txt").await.unwrap().len(), 1);
    store.service.delete("/docs/a.txt", false).await.unwrap();
    store.put("/docs", "a.txt", b"fresh").await;
    assert!(store.service.versions("/docs/a.txt").await.unwrap().is_empty());
    assert_eq!(store.read("/docs/a.txt").await, b"fresh");
}

#[tokio::test]
async fn test_folder_properties() {
    let store = TestStore::new().await;
    store.mkdir("/", "docs").await;
    store.mkdir("/docs", "sub").await;
    store.put("/docs", "a.txt", b"12345").await;
    store.put("/docs/sub", "b.txt", b"123").await;
    store.put("/docs/sub", "b.txt", b"1234567").await;
    let partial = store.chunk(b"xx");
    store
        .service
        .upload_file("/docs", "partial.bin", &partial, 0, false, OWNER)
        .await
        .unwrap();

    let props = store.service.folder_properties("/docs").await.unwrap();
    assert_eq!(
        props,
        FolderProperties {
            file_count: 2,
            folder_count: 1,
            total_size: 12
        }
    );
    let err = store.service.folder_properties("/docs/a.txt").await.unwrap_err();
    assert!(matches!(err, StorageError::NotAFolder(_)));
    let err = store.service.folder_properties("/nope").await.unwrap_err();
    assert!(err.is_not_found());
}

#[tokio::test]
async fn test_mutations_wait_for_path_locks() {
    let store = TestStore::new().await;
    store.mkdir("/", "docs").await;

    let guard = store.service.locks().acquire(["/docs"]).await;
    let task = {
        let service = store.service.clone();
        tokio::spawn(async move { service.create_folder("/docs", "inner", OWNER).await })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(!task.is_finished());
    assert!(!store.service.exists("/docs/inner").await.unwrap());

    drop(guard);
    tokio::time::timeout(Duration::from_secs(5), task)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert!(store.service.exists("/docs/inner").await.unwrap());
    assert_eq!(store.service.locks().held_count(), 0);
}
