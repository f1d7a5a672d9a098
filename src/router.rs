//! Route table
//!
//! A trie over path segments. Each node holds path-level middleware (applies
//! to every event at or below the node) and per-event middleware lists.
//!
//! Resolution walks the request path from `/` and gathers, at every node it
//! reaches, the node's path-level middleware followed by the middleware
//! registered for the requested event. Handlers on a path prefix therefore
//! run before handlers on the full path. A missing segment ends the walk and
//! whatever was gathered so far is returned.

use std::collections::HashMap;
use std::fmt;

use crate::chain::{Handler, MiddlewareChain};
use crate::error::AppError;

/// A trie node
#[derive(Clone, Default)]
pub struct RouteNode {
    children: HashMap<String, RouteNode>,
    middleware: Vec<Handler>,
    events: HashMap<String, Vec<Handler>>,
}

impl RouteNode {
    fn descend<'a, I>(&mut self, segments: I) -> &mut RouteNode
    where
        I: IntoIterator<Item = &'a str>,
    {
        segments.into_iter().fold(self, |node, segment| {
            node.children.entry(segment.to_string()).or_default()
        })
    }

    fn merge(&mut self, other: RouteNode) {
        self.middleware.extend(other.middleware);
        for (event, handlers) in other.events {
            self.events.entry(event).or_default().extend(handlers);
        }
        for (segment, child) in other.children {
            self.children.entry(segment).or_default().merge(child);
        }
    }
}

impl fmt::Debug for RouteNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RouteNode")
            .field("children", &self.children)
            .field("middleware", &self.middleware.len())
            .field("events", &self.events.keys().collect::<Vec<_>>())
            .finish()
    }
}

/// Split a path into its non-empty segments
fn segments(path: &str) -> impl Iterator<Item = &str> {
    path.split('/').filter(|segment| !segment.is_empty())
}

/// Maps `(path, event)` to an ordered middleware list
#[derive(Debug, Clone, Default)]
pub struct RouteTable {
    /// Node for `/`, created on first registration
    root: Option<RouteNode>,
}

impl RouteTable {
    pub fn new() -> Self {
        Self::default()
    }

    fn node_mut(&mut self, path: &str) -> &mut RouteNode {
        self.root.get_or_insert_with(RouteNode::default).descend(segments(path))
    }

    /// Append handlers for `event` at `path`
    ///
    /// Repeated registrations accumulate in registration order.
    pub fn register(
        &mut self,
        path: &str,
        event: impl AsRef<str>,
        handlers: impl IntoIterator<Item = Handler>,
    ) -> &mut Self {
        self.node_mut(path)
            .events
            .entry(event.as_ref().to_string())
            .or_default()
            .extend(handlers);
        self
    }

    /// Append path-level handlers that run for every event at or below `path`
    pub fn use_middleware(
        &mut self,
        path: &str,
        handlers: impl IntoIterator<Item = Handler>,
    ) -> &mut Self {
        self.node_mut(path).middleware.extend(handlers);
        self
    }

    /// Gather the middleware for `(path, event)`
    ///
    /// Never fails: an unknown path yields the handlers of its longest known
    /// prefix, possibly none.
    pub fn resolve(&self, path: &str, event: impl AsRef<str>) -> MiddlewareChain {
        let event = event.as_ref();
        let mut chain = MiddlewareChain::default();

        let Some(root) = &self.root else {
            return chain;
        };

        let mut node = root;
        let mut remaining = segments(path);
        loop {
            chain.push(node.middleware.iter().cloned());
            if let Some(handlers) = node.events.get(event) {
                chain.push(handlers.iter().cloned());
            }

            let Some(segment) = remaining.next() else {
                break;
            };
            match node.children.get(segment) {
                Some(child) => node = child,
                None => break,
            }
        }

        chain
    }

    /// Graft another table's `/` subtree at `mount_path`
    ///
    /// Handlers from `other` are appended after any already present at the
    /// corresponding nodes of this table.
    pub fn mount(&mut self, mount_path: &str, other: RouteTable) -> Result<&mut Self, AppError> {
        let Some(subtree) = other.root else {
            return Err(AppError::InvalidMount(mount_path.to_string()));
        };
        self.node_mut(mount_path).merge(subtree);
        Ok(self)
    }

    /// Whether anything has been registered
    pub fn is_empty(&self) -> bool {
        self.root.is_none()
    }
}
