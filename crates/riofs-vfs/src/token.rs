//! Cross-request authorization tokens.
//!
//! Rename and link name their destination parent with a token issued by an
//! earlier request on a different connection. The table maps opaque token
//! identities to weak node references: it never extends a node's lifetime,
//! so a token whose directory has been released resolves to nothing.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use dashmap::DashMap;
use riofs_proto::{Token, VfsError, VfsResult};

use crate::node::{Node, NodeRef};

/// Process-local token table.
#[derive(Debug, Default)]
pub struct TokenTable {
    map: DashMap<u64, Weak<Node>>,
    next_id: AtomicU64,
}

impl TokenTable {
    /// An empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Issue a fresh token associated with `node`.
    pub fn issue(&self, node: &NodeRef) -> Token {
        // Identity 0 is reserved as "never issued".
        let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        self.map.insert(id, Arc::downgrade(node));
        Token::from_raw(id)
    }

    /// Resolve a token without erasing it.
    ///
    /// Fails `InvalidArgument` when the token was never issued, was already
    /// consumed or invalidated, or its node has been released.
    pub fn resolve(&self, token: Token) -> VfsResult<NodeRef> {
        self.map
            .get(&token.id())
            .and_then(|weak| weak.upgrade())
            .ok_or(VfsError::InvalidArgument)
    }

    /// Resolve a token, erasing the association so later uses fail.
    pub fn consume(&self, token: Token) -> VfsResult<NodeRef> {
        let (_, weak) = self
            .map
            .remove(&token.id())
            .ok_or(VfsError::InvalidArgument)?;
        weak.upgrade().ok_or(VfsError::InvalidArgument)
    }

    /// Erase a token's association, if present.
    pub fn invalidate(&self, token: Token) {
        self.map.remove(&token.id());
    }

    /// Number of live associations.
    pub fn len(&self) -> usize {
        self.map.len()
    }

    /// Whether no associations exist.
    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }
}
