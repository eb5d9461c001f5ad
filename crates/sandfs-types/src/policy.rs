//! Access policy and visibility views.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use crate::error::DenyReason;

/// Visibility label carried by nodes with no explicit policy.
pub const DEFAULT_VISIBILITY: &str = "public";

/// Per-path access policy.
///
/// Absence of a policy for a path means [`NodePolicy::default`]: readable,
/// writable, appendable, visible as [`DEFAULT_VISIBILITY`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NodePolicy {
    pub readable: bool,
    pub writable: bool,
    pub appendable: bool,
    /// Visibility label matched against a [`VisibilityView`].
    pub visibility: String,
    /// If non-empty, only views naming one of these principals see the node.
    pub principals: BTreeSet<String>,
}

impl Default for NodePolicy {
    fn default() -> Self {
        Self {
            readable: true,
            writable: true,
            appendable: true,
            visibility: DEFAULT_VISIBILITY.to_string(),
            principals: BTreeSet::new(),
        }
    }
}

impl NodePolicy {
    /// Neither writable nor appendable.
    pub fn read_only() -> Self {
        Self {
            writable: false,
            appendable: false,
            ..Self::default()
        }
    }

    /// Appends allowed, overwrites rejected.
    pub fn append_only() -> Self {
        Self {
            writable: false,
            appendable: true,
            ..Self::default()
        }
    }

    pub fn with_visibility(mut self, label: impl Into<String>) -> Self {
        self.visibility = label.into();
        self
    }

    pub fn with_principals<I, S>(mut self, principals: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.principals = principals.into_iter().map(Into::into).collect();
        self
    }

    pub fn unreadable(mut self) -> Self {
        self.readable = false;
        self
    }

    /// Check whether `op` is allowed by this policy.
    pub fn check(&self, op: Operation) -> Result<(), DenyReason> {
        let allowed = match op {
            Operation::Read | Operation::List => self.readable,
            Operation::Write => self.writable,
            Operation::Append => self.appendable,
        };
        if allowed {
            Ok(())
        } else {
            Err(match op {
                Operation::Read | Operation::List => DenyReason::NotReadable,
                Operation::Write => DenyReason::NotWritable,
                Operation::Append => DenyReason::NotAppendable,
            })
        }
    }
}

/// Kind of access being checked against a policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    Read,
    Write,
    Append,
    List,
}

/// An immutable filter over visibility labels and principals.
///
/// Nodes outside the view behave as if they do not exist.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VisibilityView {
    labels: Option<BTreeSet<String>>,
    principals: Option<BTreeSet<String>>,
}

impl VisibilityView {
    /// A view that sees every node, principal-restricted ones included.
    pub fn unrestricted() -> Self {
        Self::default()
    }

    /// A view restricted to the given labels.
    pub fn only<I, S>(labels: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            labels: Some(labels.into_iter().map(Into::into).collect()),
            principals: None,
        }
    }

    pub fn with_principals<I, S>(mut self, principals: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.principals = Some(principals.into_iter().map(Into::into).collect());
        self
    }

    pub fn is_unrestricted(&self) -> bool {
        self.labels.is_none() && self.principals.is_none()
    }

    pub fn labels(&self) -> Option<&BTreeSet<String>> {
        self.labels.as_ref()
    }

    /// Whether a node carrying `policy` is observable through this view.
    ///
    /// A node restricted to principals is only visible to views naming one of
    /// them; label restrictions do not apply to it.
    pub fn allows(&self, policy: &NodePolicy) -> bool {
        if self.is_unrestricted() {
            return true;
        }
        if !policy.principals.is_empty() {
            return match &self.principals {
                Some(mine) => !mine.is_disjoint(&policy.principals),
                None => false,
            };
        }
        match &self.labels {
            Some(labels) => labels.contains(&policy.visibility),
            None => true,
        }
    }
}
