//! Providers: code that supplies directory listings and file content on demand.
//!
//! A [`DirectoryProvider`] is mounted at a directory and asked for its
//! children when an operation first reaches that directory. A
//! [`ContentProvider`] backs a single dynamic file and is asked for bytes on
//! read. Both are async and are always invoked with no sandbox lock held, so
//! a provider may call back into the sandbox.
//!
//! Closures can be used directly through [`provider_fn`] and [`content_fn`]:
//!
//! ```
//! use sandfs_kernel::{provider_fn, ProvidedNode, Listing};
//!
//! let tickets = provider_fn(|_ctx| {
//!     let mut listing = Listing::new();
//!     listing.insert("T-1.md".into(), ProvidedNode::file("open"));
//!     Ok(listing)
//! });
//! ```

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use sandfs_types::{Metadata, NodePolicy, VfsPath};

/// Children supplied by a directory provider, keyed by name.
pub type Listing = BTreeMap<String, ProvidedNode>;

/// What a provider is told about the node it is resolving.
#[derive(Debug, Clone)]
pub struct NodeContext {
    pub path: VfsPath,
    /// Metadata attached to the node when it was mounted or provided.
    pub metadata: Metadata,
    /// Identifier of the access context that triggered the call.
    pub context_id: u64,
}

/// How often a directory provider is consulted.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum RefreshPolicy {
    /// Once per access context.
    #[default]
    PerContext,
    /// Once for the lifetime of the mount (until invalidated).
    Once,
}

/// Supplies the children of a mounted directory.
#[async_trait]
pub trait DirectoryProvider: Send + Sync {
    async fn list(&self, ctx: &NodeContext) -> anyhow::Result<Listing>;

    fn refresh(&self) -> RefreshPolicy {
        RefreshPolicy::PerContext
    }
}

/// Supplies the bytes of a dynamic file.
#[async_trait]
pub trait ContentProvider: Send + Sync {
    async fn content(&self, ctx: &NodeContext) -> anyhow::Result<Vec<u8>>;
}

/// Content of a provided file.
#[derive(Clone)]
pub enum ProvidedContent {
    Static(Vec<u8>),
    /// Resolved on read, once per access context.
    Dynamic(Arc<dyn ContentProvider>),
}

impl fmt::Debug for ProvidedContent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProvidedContent::Static(bytes) => write!(f, "Static({} bytes)", bytes.len()),
            ProvidedContent::Dynamic(_) => f.write_str("Dynamic(..)"),
        }
    }
}

/// A node returned by a directory provider.
#[derive(Clone)]
pub enum ProvidedNode {
    File {
        content: ProvidedContent,
        policy: Option<NodePolicy>,
        metadata: Metadata,
    },
    Directory {
        children: Listing,
        /// Nested provider, consulted when an operation reaches this directory.
        provider: Option<Arc<dyn DirectoryProvider>>,
        policy: Option<NodePolicy>,
        metadata: Metadata,
    },
}

impl ProvidedNode {
    /// A file with fixed content.
    pub fn file(content: impl Into<Vec<u8>>) -> Self {
        ProvidedNode::File {
            content: ProvidedContent::Static(content.into()),
            policy: None,
            metadata: Metadata::new(),
        }
    }

    /// A file whose content is resolved on read.
    pub fn dynamic_file(provider: impl ContentProvider + 'static) -> Self {
        ProvidedNode::File {
            content: ProvidedContent::Dynamic(Arc::new(provider)),
            policy: None,
            metadata: Metadata::new(),
        }
    }

    /// A directory with fixed children.
    pub fn directory<I, S>(children: I) -> Self
    where
        I: IntoIterator<Item = (S, ProvidedNode)>,
        S: Into<String>,
    {
        ProvidedNode::Directory {
            children: children.into_iter().map(|(k, v)| (k.into(), v)).collect(),
            provider: None,
            policy: None,
            metadata: Metadata::new(),
        }
    }

    /// A directory whose children come from a nested provider.
    pub fn lazy_directory(provider: impl DirectoryProvider + 'static) -> Self {
        ProvidedNode::Directory {
            children: Listing::new(),
            provider: Some(Arc::new(provider)),
            policy: None,
            metadata: Metadata::new(),
        }
    }

    pub fn with_policy(mut self, new_policy: NodePolicy) -> Self {
        match &mut self {
            ProvidedNode::File { policy, .. } | ProvidedNode::Directory { policy, .. } => {
                *policy = Some(new_policy)
            }
        }
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        match &mut self {
            ProvidedNode::File { metadata, .. } | ProvidedNode::Directory { metadata, .. } => {
                metadata.insert(key.into(), value);
            }
        }
        self
    }

    pub fn is_dir(&self) -> bool {
        matches!(self, ProvidedNode::Directory { .. })
    }
}

impl fmt::Debug for ProvidedNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProvidedNode::File {
                content, policy, ..
            } => f
                .debug_struct("File")
                .field("content", content)
                .field("policy", policy)
                .finish(),
            ProvidedNode::Directory {
                children,
                provider,
                policy,
                ..
            } => f
                .debug_struct("Directory")
                .field("children", children)
                .field("lazy", &provider.is_some())
                .field("policy", policy)
                .finish(),
        }
    }
}

/// Directory provider backed by a closure. Built with [`provider_fn`].
pub struct FnProvider<F> {
    f: F,
    refresh: RefreshPolicy,
}

impl<F> FnProvider<F> {
    /// Consult the closure once per mount instead of once per context.
    pub fn refresh_once(mut self) -> Self {
        self.refresh = RefreshPolicy::Once;
        self
    }
}

#[async_trait]
impl<F> DirectoryProvider for FnProvider<F>
where
    F: Fn(&NodeContext) -> anyhow::Result<Listing> + Send + Sync,
{
    async fn list(&self, ctx: &NodeContext) -> anyhow::Result<Listing> {
        (self.f)(ctx)
    }

    fn refresh(&self) -> RefreshPolicy {
        self.refresh
    }
}

/// Wrap a synchronous closure as a [`DirectoryProvider`].
pub fn provider_fn<F>(f: F) -> FnProvider<F>
where
    F: Fn(&NodeContext) -> anyhow::Result<Listing> + Send + Sync,
{
    FnProvider {
        f,
        refresh: RefreshPolicy::PerContext,
    }
}

/// Content provider backed by a closure. Built with [`content_fn`].
pub struct FnContent<F>(F);

#[async_trait]
impl<F> ContentProvider for FnContent<F>
where
    F: Fn(&NodeContext) -> anyhow::Result<Vec<u8>> + Send + Sync,
{
    async fn content(&self, ctx: &NodeContext) -> anyhow::Result<Vec<u8>> {
        (self.0)(ctx)
    }
}

/// Wrap a synchronous closure as a [`ContentProvider`].
pub fn content_fn<F>(f: F) -> FnContent<F>
where
    F: Fn(&NodeContext) -> anyhow::Result<Vec<u8>> + Send + Sync,
{
    FnContent(f)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx() -> NodeContext {
        NodeContext {
            path: VfsPath::parse("/mnt").unwrap(),
            metadata: Metadata::new(),
            context_id: 1,
        }
    }

    #[tokio::test]
    async fn closure_provider_lists() {
        let provider = provider_fn(|ctx| {
            let mut listing = Listing::new();
            listing.insert("where".into(), ProvidedNode::file(ctx.path.to_string()));
            Ok(listing)
        });
        assert_eq!(provider.refresh(), RefreshPolicy::PerContext);

        let listing = provider.list(&ctx()).await.unwrap();
        match &listing["where"] {
            ProvidedNode::File {
                content: ProvidedContent::Static(bytes),
                ..
            } => assert_eq!(bytes, b"/mnt"),
            other => panic!("unexpected node {other:?}"),
        }
    }

    #[tokio::test]
    async fn closure_content_resolves() {
        let provider = content_fn(|ctx| Ok(format!("ctx {}", ctx.context_id).into_bytes()));
        assert_eq!(provider.content(&ctx()).await.unwrap(), b"ctx 1");
    }

    #[test]
    fn builders_attach_policy_and_metadata() {
        let node = ProvidedNode::directory([("a", ProvidedNode::file("x"))])
            .with_policy(NodePolicy::read_only())
            .with_metadata("source", serde_json::json!("tickets"));

        match node {
            ProvidedNode::Directory {
                children,
                policy,
                metadata,
                ..
            } => {
                assert!(children.contains_key("a"));
                assert_eq!(policy, Some(NodePolicy::read_only()));
                assert_eq!(metadata["source"], "tickets");
            }
            ProvidedNode::File { .. } => panic!("expected a directory"),
        }
    }
}
