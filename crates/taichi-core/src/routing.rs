//! Ordered route table with first-match-wins dispatch.
//!
//! Patterns are regular expressions matched against the whole request
//! path (the query string is never part of the match). Bindings are scanned
//! in registration order and the first match wins; overlapping patterns are
//! not detected. A catch-all such as `.*` registered before a more specific
//! pattern shadows it permanently, so mount specific prefixes first.
//!
//! The table is built with [`RouteTableBuilder`] while the server is
//! mounting and frozen into a read-only [`RouteTable`] before the listener
//! is bound. Freezing consumes the builder, so nothing can be registered
//! once the server is accepting connections.

use std::fmt;
use std::sync::Arc;

use regex::Regex;

use crate::error::{GatewayError, GatewayResult};

/// A compiled, fully-anchored path pattern
#[derive(Clone)]
pub struct RoutePattern {
    source: String,
    regex: Regex,
}

impl RoutePattern {
    /// Compile a pattern. The expression must match the entire path.
    ///
    /// ```
    /// # use taichi_core::routing::RoutePattern;
    /// let pattern = RoutePattern::new("/webssh/.*").unwrap();
    /// assert!(pattern.matches("/webssh/ws"));
    /// assert!(!pattern.matches("/api/webssh/ws"));
    /// ```
    pub fn new(pattern: &str) -> GatewayResult<Self> {
        let regex = Regex::new(&format!("^(?:{})$", pattern)).map_err(|source| {
            GatewayError::InvalidPattern {
                pattern: pattern.to_string(),
                source,
            }
        })?;
        Ok(Self {
            source: pattern.to_string(),
            regex,
        })
    }

    /// Whether the pattern matches the given request path
    pub fn matches(&self, path: &str) -> bool {
        self.regex.is_match(path)
    }

    /// The pattern as it was registered
    pub fn as_str(&self) -> &str {
        &self.source
    }
}

impl fmt::Debug for RoutePattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("RoutePattern").field(&self.source).finish()
    }
}

impl fmt::Display for RoutePattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.source)
    }
}

/// A (pattern, handler) pair
#[derive(Debug, Clone)]
pub struct RouteBinding<H> {
    pattern: RoutePattern,
    handler: H,
}

impl<H> RouteBinding<H> {
    pub fn pattern(&self) -> &RoutePattern {
        &self.pattern
    }

    pub fn handler(&self) -> &H {
        &self.handler
    }
}

/// Mutable route table, only available while mounting
#[derive(Debug)]
pub struct RouteTableBuilder<H> {
    bindings: Vec<RouteBinding<H>>,
}

impl<H> Default for RouteTableBuilder<H> {
    fn default() -> Self {
        Self {
            bindings: Vec::new(),
        }
    }
}

impl<H> RouteTableBuilder<H> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a binding. No overlap check is performed against existing
    /// bindings; registration order decides precedence.
    pub fn register(&mut self, pattern: &str, handler: H) -> GatewayResult<&mut Self> {
        let pattern = RoutePattern::new(pattern)?;
        tracing::debug!(
            pattern = %pattern,
            position = self.bindings.len(),
            "Registered route"
        );
        self.bindings.push(RouteBinding { pattern, handler });
        Ok(self)
    }

    pub fn len(&self) -> usize {
        self.bindings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bindings.is_empty()
    }

    /// Freeze the table. The result is read-only and cheap to clone.
    pub fn freeze(self) -> RouteTable<H> {
        RouteTable {
            bindings: self.bindings.into(),
        }
    }
}

/// Frozen, read-only route table
#[derive(Debug)]
pub struct RouteTable<H> {
    bindings: Arc<[RouteBinding<H>]>,
}

impl<H> Clone for RouteTable<H> {
    fn clone(&self) -> Self {
        Self {
            bindings: Arc::clone(&self.bindings),
        }
    }
}

impl<H> RouteTable<H> {
    /// Return the first binding whose pattern matches `path`.
    pub fn dispatch(&self, path: &str) -> GatewayResult<&RouteBinding<H>> {
        self.bindings
            .iter()
            .find(|binding| binding.pattern.matches(path))
            .ok_or_else(|| GatewayError::NoRouteMatched(path.to_string()))
    }

    /// Bindings in registration order
    pub fn bindings(&self) -> &[RouteBinding<H>] {
        &self.bindings
    }

    pub fn len(&self) -> usize {
        self.bindings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bindings.is_empty()
    }
}
