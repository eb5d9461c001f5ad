//! Concurrent access to a shared sandbox.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use sandfs_kernel::{Listing, ProvidedNode, VfsError, VfsPath, VirtualFileSystem, provider_fn};

fn p(s: &str) -> VfsPath {
    VfsPath::parse(s).expect("valid path")
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn racing_writers_with_same_expected_version() {
    let vfs = Arc::new(VirtualFileSystem::new());
    let path = p("/shared/counter");
    vfs.write_file(&vfs.context(), &path, "0", None).await.unwrap();

    for round in 1..=50u64 {
        let tasks: Vec<_> = (0..2)
            .map(|writer| {
                let vfs = Arc::clone(&vfs);
                let path = path.clone();
                tokio::spawn(async move {
                    let ctx = vfs.context();
                    vfs.write_file(&ctx, &path, format!("{round}-{writer}"), Some(round))
                        .await
                })
            })
            .collect();

        let mut ok = 0;
        let mut conflicts = 0;
        for task in tasks {
            match task.await.unwrap() {
                Ok(outcome) => {
                    assert_eq!(outcome.version, round + 1);
                    ok += 1;
                }
                Err(VfsError::VersionConflict { current, .. }) => {
                    assert_eq!(current, round + 1);
                    conflicts += 1;
                }
                Err(other) => panic!("unexpected error {other:?}"),
            }
        }
        assert_eq!((ok, conflicts), (1, 1), "round {round}");
    }

    assert_eq!(vfs.get_version(&vfs.context(), &path).await.unwrap(), 51);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn racing_creators_with_expected_zero() {
    let vfs = Arc::new(VirtualFileSystem::new());

    for round in 0..50 {
        let path = p(&format!("/new/{round}.txt"));
        let tasks: Vec<_> = (0..3)
            .map(|writer| {
                let vfs = Arc::clone(&vfs);
                let path = path.clone();
                tokio::spawn(async move {
                    vfs.write_file(&vfs.context(), &path, format!("writer {writer}"), Some(0))
                        .await
                })
            })
            .collect();

        let mut winners = 0;
        for task in tasks {
            match task.await.unwrap() {
                Ok(outcome) => {
                    assert_eq!(outcome.version, 1);
                    winners += 1;
                }
                Err(err) => assert_eq!(err.current_version(), Some(1)),
            }
        }
        assert_eq!(winners, 1, "round {round}");
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn unconditional_appends_are_not_lost() {
    let vfs = Arc::new(VirtualFileSystem::new());
    let path = p("/log.txt");
    vfs.write_file(&vfs.context(), &path, "", None).await.unwrap();

    let tasks: Vec<_> = (0..8)
        .map(|_| {
            let vfs = Arc::clone(&vfs);
            let path = path.clone();
            tokio::spawn(async move {
                let ctx = vfs.context();
                for _ in 0..25 {
                    vfs.append_file(&ctx, &path, "x").await.unwrap();
                }
            })
        })
        .collect();
    for task in tasks {
        task.await.unwrap();
    }

    let data = vfs.read_file(&vfs.context(), &path).await.unwrap();
    assert_eq!(data.content.len(), 200);
    assert_eq!(data.version, 201);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_contexts_hydrate_independently() {
    let calls = Arc::new(AtomicUsize::new(0));
    let vfs = Arc::new(VirtualFileSystem::new());
    let counter = Arc::clone(&calls);
    vfs.mount_directory(
        &p("/feed"),
        provider_fn(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(Listing::from([("item".to_string(), ProvidedNode::file("x"))]))
        }),
    )
    .unwrap();

    let tasks: Vec<_> = (0..8)
        .map(|_| {
            let vfs = Arc::clone(&vfs);
            tokio::spawn(async move {
                let ctx = vfs.context();
                for _ in 0..5 {
                    let data = vfs.read_file(&ctx, &p("/feed/item")).await.unwrap();
                    assert_eq!(data.content, b"x");
                }
            })
        })
        .collect();
    for task in tasks {
        task.await.unwrap();
    }

    assert_eq!(calls.load(Ordering::SeqCst), 8);
}
