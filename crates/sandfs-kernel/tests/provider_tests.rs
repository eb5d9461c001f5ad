//! Provider and hydration tests.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use sandfs_kernel::{
    ContentProvider, DirectoryProvider, Listing, NodeContext, NodePolicy, ProvidedNode,
    RefreshPolicy, VfsError, VfsPath, VirtualFileSystem, VisibilityView, content_fn, provider_fn,
};

fn p(s: &str) -> VfsPath {
    VfsPath::parse(s).expect("valid path")
}

/// Directory provider that counts its calls and lists `call-N.txt`.
struct Counting {
    calls: Arc<AtomicUsize>,
    refresh: RefreshPolicy,
}

#[async_trait]
impl DirectoryProvider for Counting {
    async fn list(&self, _ctx: &NodeContext) -> anyhow::Result<Listing> {
        let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        let mut listing = Listing::new();
        listing.insert(format!("call-{n}.txt"), ProvidedNode::file(n.to_string()));
        Ok(listing)
    }

    fn refresh(&self) -> RefreshPolicy {
        self.refresh
    }
}

fn counting(refresh: RefreshPolicy) -> (Counting, Arc<AtomicUsize>) {
    let calls = Arc::new(AtomicUsize::new(0));
    (
        Counting {
            calls: Arc::clone(&calls),
            refresh,
        },
        calls,
    )
}

async fn names(vfs: &VirtualFileSystem, ctx: &sandfs_kernel::AccessContext, path: &str) -> Vec<String> {
    vfs.list_dir(ctx, &p(path))
        .await
        .unwrap()
        .into_iter()
        .map(|e| e.name)
        .collect()
}

#[tokio::test]
async fn mount_is_hydrated_on_first_access() {
    let vfs = VirtualFileSystem::new();
    vfs.mount_directory(
        &p("/tickets"),
        provider_fn(|_| {
            let mut listing = Listing::new();
            listing.insert("T-1.md".into(), ProvidedNode::file("# T-1\nopen"));
            listing.insert(
                "archive".into(),
                ProvidedNode::directory([("T-0.md", ProvidedNode::file("closed"))]),
            );
            Ok(listing)
        }),
    )
    .unwrap();
    let ctx = vfs.context();

    assert_eq!(names(&vfs, &ctx, "/tickets").await, vec!["T-1.md", "archive"]);
    let data = vfs.read_file(&ctx, &p("/tickets/archive/T-0.md")).await.unwrap();
    assert_eq!(data.text(), "closed");
    assert_eq!(data.version, 0);

    let stat = vfs.lookup(&ctx, &p("/tickets/T-1.md")).await.unwrap();
    assert!(stat.provided);
}

#[tokio::test]
async fn per_context_provider_runs_once_per_context() {
    let vfs = VirtualFileSystem::new();
    let (provider, calls) = counting(RefreshPolicy::PerContext);
    vfs.mount_directory(&p("/live"), provider).unwrap();

    let first = vfs.context();
    assert_eq!(names(&vfs, &first, "/live").await, vec!["call-1.txt"]);
    assert_eq!(names(&vfs, &first, "/live").await, vec!["call-1.txt"]);
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    let second = vfs.context();
    assert_eq!(names(&vfs, &second, "/live").await, vec!["call-2.txt"]);
    assert_eq!(calls.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn once_provider_runs_once_until_invalidated() {
    let vfs = VirtualFileSystem::new();
    let (provider, calls) = counting(RefreshPolicy::Once);
    vfs.mount_directory(&p("/static"), provider).unwrap();

    names(&vfs, &vfs.context(), "/static").await;
    names(&vfs, &vfs.context(), "/static").await;
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    vfs.invalidate_mount(&p("/static")).unwrap();
    assert_eq!(names(&vfs, &vfs.context(), "/static").await, vec!["call-2.txt"]);
    assert_eq!(calls.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn local_changes_survive_rehydration() {
    let vfs = VirtualFileSystem::new();
    let (provider, _) = counting(RefreshPolicy::PerContext);
    vfs.mount_directory(&p("/m"), provider).unwrap();

    let ctx = vfs.context();
    names(&vfs, &ctx, "/m").await;
    // Edit the provided file and add a local one.
    vfs.write_file(&ctx, &p("/m/call-1.txt"), "edited", None).await.unwrap();
    vfs.write_file(&ctx, &p("/m/mine.txt"), "local", None).await.unwrap();

    let next = vfs.context();
    assert_eq!(
        names(&vfs, &next, "/m").await,
        vec!["call-1.txt", "call-2.txt", "mine.txt"]
    );
    assert_eq!(vfs.read_file(&next, &p("/m/call-1.txt")).await.unwrap().text(), "edited");
}

#[tokio::test]
async fn untouched_provided_nodes_are_replaced() {
    let vfs = VirtualFileSystem::new();
    let (provider, _) = counting(RefreshPolicy::PerContext);
    vfs.mount_directory(&p("/m"), provider).unwrap();

    names(&vfs, &vfs.context(), "/m").await;
    assert_eq!(names(&vfs, &vfs.context(), "/m").await, vec!["call-2.txt"]);
}

#[tokio::test]
async fn first_write_to_provided_file_is_version_one() {
    let vfs = VirtualFileSystem::new();
    vfs.mount_directory(
        &p("/cfg"),
        provider_fn(|_| Ok(Listing::from([("app.toml".to_string(), ProvidedNode::file("a=1"))]))),
    )
    .unwrap();
    let ctx = vfs.context();

    // The provided file exists, so a create-only write must not replace it.
    let err = vfs.write_file(&ctx, &p("/cfg/app.toml"), "a=2", Some(0)).await.unwrap_err();
    assert_eq!(err, VfsError::AlreadyExists(p("/cfg/app.toml")));

    let outcome = vfs.write_file(&ctx, &p("/cfg/app.toml"), "a=2", None).await.unwrap();
    assert_eq!(outcome.version, 1);
    assert!(!vfs.lookup(&ctx, &p("/cfg/app.toml")).await.unwrap().provided);
}

/// Directory provider whose listing holds one `gen-N` file per call.
fn generations() -> (impl DirectoryProvider + 'static, Arc<AtomicUsize>) {
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&calls);
    let provider = provider_fn(move |_| {
        let n = counter.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(Listing::from([(format!("gen-{n}"), ProvidedNode::file(format!("body {n}")))]))
    });
    (provider, calls)
}

#[tokio::test]
async fn rehydration_in_one_context_leaves_another_untouched() {
    let vfs = VirtualFileSystem::new();
    let (provider, calls) = generations();
    vfs.mount_directory(&p("/feed"), provider).unwrap();
    let a = vfs.context();
    let b = vfs.context();

    assert_eq!(names(&vfs, &a, "/feed").await, vec!["gen-1"]);
    assert_eq!(names(&vfs, &b, "/feed").await, vec!["gen-2"]);

    assert_eq!(names(&vfs, &a, "/feed").await, vec!["gen-1"]);
    assert_eq!(vfs.read_file(&a, &p("/feed/gen-1")).await.unwrap().text(), "body 1");
    assert!(vfs.read_file(&a, &p("/feed/gen-2")).await.unwrap_err().is_not_found());
    assert_eq!(vfs.read_file(&b, &p("/feed/gen-2")).await.unwrap().text(), "body 2");
    assert_eq!(calls.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn removing_a_provided_file_is_scoped_to_the_context() {
    let vfs = VirtualFileSystem::new();
    vfs.mount_directory(
        &p("/inbox"),
        provider_fn(|_| Ok(Listing::from([("msg".to_string(), ProvidedNode::file("hi"))]))),
    )
    .unwrap();
    let a = vfs.context();
    let b = vfs.context();
    names(&vfs, &b, "/inbox").await;

    vfs.remove(&a, &p("/inbox/msg"), false).await.unwrap();

    assert!(names(&vfs, &a, "/inbox").await.is_empty());
    assert_eq!(names(&vfs, &b, "/inbox").await, vec!["msg"]);
}

#[tokio::test]
async fn once_listing_is_shared_until_invalidated() {
    let vfs = VirtualFileSystem::new();
    let (provider, _) = counting(RefreshPolicy::Once);
    vfs.mount_directory(&p("/static"), provider).unwrap();
    let early = vfs.context();

    assert_eq!(names(&vfs, &early, "/static").await, vec!["call-1.txt"]);
    vfs.invalidate_mount(&p("/static")).unwrap();
    assert_eq!(names(&vfs, &vfs.context(), "/static").await, vec!["call-2.txt"]);
    // The shared listing was replaced for everyone.
    assert_eq!(names(&vfs, &early, "/static").await, vec!["call-2.txt"]);
}

#[tokio::test]
async fn provider_failure_is_reported_and_tree_unchanged() {
    let vfs = VirtualFileSystem::new();
    vfs.mount_directory(&p("/broken"), provider_fn(|_| anyhow::bail!("backend unreachable")))
        .unwrap();
    let ctx = vfs.context();

    let err = vfs.list_dir(&ctx, &p("/broken")).await.unwrap_err();
    match err {
        VfsError::Provider { path, cause } => {
            assert_eq!(path, p("/broken"));
            assert!(cause.contains("backend unreachable"));
        }
        other => panic!("expected provider error, got {other:?}"),
    }
    let err = vfs.read_file(&ctx, &p("/broken/x")).await.unwrap_err();
    assert!(matches!(err, VfsError::Provider { .. }));
}

#[tokio::test]
async fn nested_lazy_directories_hydrate_on_the_way_down() {
    let vfs = VirtualFileSystem::new();
    vfs.mount_directory(
        &p("/org"),
        provider_fn(|_| {
            let team = ProvidedNode::lazy_directory(provider_fn(|ctx| {
                Ok(Listing::from([(
                    "members.txt".to_string(),
                    ProvidedNode::file(format!("listed at {}", ctx.path)),
                )]))
            }));
            Ok(Listing::from([("team".to_string(), team)]))
        }),
    )
    .unwrap();
    let ctx = vfs.context();

    let data = vfs.read_file(&ctx, &p("/org/team/members.txt")).await.unwrap();
    assert_eq!(data.text(), "listed at /org/team");
    assert!(vfs.mount_points().unwrap().contains(&p("/org/team")));
}

#[tokio::test]
async fn provider_policies_apply_to_provided_nodes() {
    let vfs = VirtualFileSystem::new();
    vfs.mount_directory(
        &p("/hr"),
        provider_fn(|_| {
            Ok(Listing::from([
                (
                    "salaries.csv".to_string(),
                    ProvidedNode::file("...").with_policy(
                        NodePolicy::read_only().with_visibility("confidential"),
                    ),
                ),
                ("handbook.md".to_string(), ProvidedNode::file("be kind")),
            ]))
        }),
    )
    .unwrap();

    let staff = vfs.context_with_view(VisibilityView::only(["public"]));
    assert_eq!(names(&vfs, &staff, "/hr").await, vec!["handbook.md"]);

    let admin = vfs.context();
    let err = vfs.write_file(&admin, &p("/hr/salaries.csv"), "x", None).await.unwrap_err();
    assert!(err.is_permission_denied());
}

struct Clock {
    ticks: AtomicUsize,
}

#[async_trait]
impl ContentProvider for Clock {
    async fn content(&self, _ctx: &NodeContext) -> anyhow::Result<Vec<u8>> {
        let t = self.ticks.fetch_add(1, Ordering::SeqCst);
        Ok(format!("tick {t}").into_bytes())
    }
}

#[tokio::test]
async fn dynamic_file_resolves_once_per_context() {
    let vfs = VirtualFileSystem::new();
    vfs.mount_file(
        &p("/sys/clock"),
        Clock {
            ticks: AtomicUsize::new(0),
        },
    )
    .unwrap();

    let ctx = vfs.context();
    assert_eq!(vfs.read_file(&ctx, &p("/sys/clock")).await.unwrap().text(), "tick 0");
    assert_eq!(vfs.read_file(&ctx, &p("/sys/clock")).await.unwrap().text(), "tick 0");

    let other = vfs.context();
    assert_eq!(vfs.read_file(&other, &p("/sys/clock")).await.unwrap().text(), "tick 1");

    vfs.invalidate_mount(&p("/sys/clock")).unwrap();
    assert_eq!(vfs.read_file(&other, &p("/sys/clock")).await.unwrap().text(), "tick 2");
}

#[tokio::test]
async fn writing_a_dynamic_file_detaches_it() {
    let vfs = VirtualFileSystem::new();
    vfs.mount_file(&p("/motd"), content_fn(|_| Ok(b"generated".to_vec())))
        .unwrap();
    let ctx = vfs.context();

    vfs.append_file(&ctx, &p("/motd"), " + local").await.unwrap();

    let other = vfs.context();
    assert_eq!(
        vfs.read_file(&other, &p("/motd")).await.unwrap().text(),
        "generated + local"
    );
}

#[tokio::test]
async fn mount_on_a_file_is_rejected() {
    let vfs = VirtualFileSystem::new();
    let ctx = vfs.context();
    vfs.write_file(&ctx, &p("/plain"), "x", None).await.unwrap();

    let err = vfs
        .mount_directory(&p("/plain"), provider_fn(|_| Ok(Listing::new())))
        .unwrap_err();
    assert_eq!(err, VfsError::NotADirectory(p("/plain")));
}

#[tokio::test]
async fn unmount_drops_provided_children() {
    let vfs = VirtualFileSystem::new();
    let (provider, _) = counting(RefreshPolicy::PerContext);
    vfs.mount_directory(&p("/m"), provider).unwrap();
    let ctx = vfs.context();
    names(&vfs, &ctx, "/m").await;
    vfs.write_file(&ctx, &p("/m/keep.txt"), "k", None).await.unwrap();

    vfs.unmount(&p("/m")).unwrap();

    assert_eq!(names(&vfs, &vfs.context(), "/m").await, vec!["keep.txt"]);
    assert!(vfs.unmount(&p("/m")).unwrap_err().is_not_found());
}

#[tokio::test]
async fn removing_a_mount_point_unmounts_it() {
    let vfs = VirtualFileSystem::new();
    let (provider, calls) = counting(RefreshPolicy::PerContext);
    vfs.mount_directory(&p("/m"), provider).unwrap();
    let ctx = vfs.context();

    vfs.remove(&ctx, &p("/m"), true).await.unwrap();

    assert!(!vfs.exists(&vfs.context(), &p("/m")).await.unwrap());
    assert!(vfs.mount_points().unwrap().is_empty());
    // Hydrated once by the remove itself.
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn provider_receives_context_identity() {
    let vfs = VirtualFileSystem::new();
    vfs.mount_directory(
        &p("/whoami"),
        provider_fn(|ctx| {
            Ok(Listing::from([(
                "id".to_string(),
                ProvidedNode::file(ctx.context_id.to_string()),
            )]))
        }),
    )
    .unwrap();

    let ctx = vfs.context();
    let data = vfs.read_file(&ctx, &p("/whoami/id")).await.unwrap();
    assert_eq!(data.text(), ctx.id().to_string());
}

#[tokio::test]
async fn arc_provider_can_be_shared_between_sandboxes() {
    let shared: Arc<dyn DirectoryProvider> = Arc::new(provider_fn(|_| {
        Ok(Listing::from([("shared.txt".to_string(), ProvidedNode::file("s"))]))
    }));
    let a = VirtualFileSystem::new();
    let b = VirtualFileSystem::new();
    a.mount_directory_arc(&p("/s"), Arc::clone(&shared)).unwrap();
    b.mount_directory_arc(&p("/s"), shared).unwrap();

    a.write_file(&a.context(), &p("/s/only-a.txt"), "a", None).await.unwrap();

    assert_eq!(names(&a, &a.context(), "/s").await, vec!["only-a.txt", "shared.txt"]);
    assert_eq!(names(&b, &b.context(), "/s").await, vec!["shared.txt"]);
}
