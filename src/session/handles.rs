//! Handle tree: flat opaque handles on the client side, hierarchical
//! root+path addressing on the server side.
//!
//! The client navigates compound values by integer `variablesReference`;
//! the server only understands a root (a stack frame, in practice) plus a
//! dotted path of member names. The tree lazily materializes a scope node
//! for every path prefix so both directions stay O(depth) and a given
//! `(frame, path)` always resolves to the same handle until the next
//! invalidation.

use crate::error::Error;
use std::collections::HashMap;

/// Arena handles start well above any `frame_id * 10 + 1` scope handle
/// (frame ids are `thread_id * 1000 + ordinal`), so the two schemes can
/// never collide.
pub const HANDLE_BASE: i64 = 1_000_000_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScopeKind {
    Local,
    Global,
    SelfObject,
    ObjectMember,
}

#[derive(Debug, Clone)]
pub struct ScopeNode {
    pub handle: i64,
    pub name: String,
    pub kind: ScopeKind,
    /// Member names from the frame's local scope down to this node. Empty
    /// path = the top-level local scope itself.
    pub path: Vec<String>,
    pub frame_id: i64,
    pub parent: Option<i64>,
    pub expensive: bool,
}

#[derive(Debug, Clone)]
pub struct VariableNode {
    pub handle: i64,
    pub name: String,
    pub value: String,
    pub type_name: Option<String>,
    pub parent_scope: i64,
    pub expandable: bool,
}

/// Addressing base of a hierarchical server-side lookup.
#[derive(Debug, Clone, Copy)]
pub enum Root {
    StackFrame { thread_id: i64, frame_index: i64 },
    /// Addressing into a previously obtained value. The server supports it;
    /// the proxy does not resolve scopes for it yet.
    Value,
}

/// Deterministic handle of a frame's Local scope.
pub fn local_scope_handle(frame_id: i64) -> i64 {
    frame_id * 10
}

/// Deterministic handle of a frame's Global scope.
pub fn global_scope_handle(frame_id: i64) -> i64 {
    frame_id * 10 + 1
}

pub struct HandleTree {
    next_handle: i64,
    scopes: HashMap<i64, ScopeNode>,
    variables: HashMap<i64, VariableNode>,
}

impl HandleTree {
    pub fn new() -> HandleTree {
        HandleTree {
            next_handle: HANDLE_BASE,
            scopes: HashMap::new(),
            variables: HashMap::new(),
        }
    }

    fn alloc(&mut self) -> i64 {
        let handle = self.next_handle;
        self.next_handle += 1;
        handle
    }

    /// Frame-state teardown. The counter is never rewound, so a handle
    /// issued before the clear is never reused afterwards.
    pub fn clear(&mut self) {
        self.scopes.clear();
        self.variables.clear();
    }

    /// Synthesize the Local and Global scopes of a frame. Idempotent: the
    /// handles derive from the frame id, so repeated requests rebuild the
    /// same nodes.
    pub fn make_frame_scopes(&mut self, frame_id: i64) -> (i64, i64) {
        let local = local_scope_handle(frame_id);
        let global = global_scope_handle(frame_id);
        self.scopes.insert(
            local,
            ScopeNode {
                handle: local,
                name: "Local".to_owned(),
                kind: ScopeKind::Local,
                path: Vec::new(),
                frame_id,
                parent: None,
                expensive: false,
            },
        );
        self.scopes.insert(
            global,
            ScopeNode {
                handle: global,
                name: "Global".to_owned(),
                kind: ScopeKind::Global,
                path: Vec::new(),
                frame_id,
                parent: None,
                expensive: false,
            },
        );
        (local, global)
    }

    pub fn scope(&self, handle: i64) -> Option<&ScopeNode> {
        self.scopes.get(&handle)
    }

    /// Lookup by structural path equality. The empty path names the Local
    /// scope (Global shares the empty path but a different kind).
    pub fn find_scope(&self, frame_id: i64, path: &[String]) -> Option<&ScopeNode> {
        self.scopes.values().find(|scope| {
            scope.frame_id == frame_id
                && scope.path == path
                && (!path.is_empty() || scope.kind == ScopeKind::Local)
        })
    }

    /// Find-or-create the scope chain for every prefix of `path`, returning
    /// the handle of the scope at the full path.
    pub fn get_or_create_scope(
        &mut self,
        root: Root,
        frame_id: Option<i64>,
        path: &[String],
    ) -> Result<i64, Error> {
        match root {
            Root::Value => return Err(Error::ValueRootUnsupported),
            Root::StackFrame { .. } => {}
        }
        let frame_id = frame_id.ok_or(Error::InvalidEvaluate)?;
        let (local, _) = match self.find_scope(frame_id, &[]) {
            Some(scope) => (scope.handle, global_scope_handle(frame_id)),
            None => self.make_frame_scopes(frame_id),
        };
        let mut parent = local;
        for i in 0..path.len() {
            let prefix = &path[..=i];
            if let Some(handle) = self.find_scope(frame_id, prefix).map(|s| s.handle) {
                parent = handle;
                continue;
            }
            let handle = self.alloc();
            let name = path[i].clone();
            let kind = if name == "self" {
                ScopeKind::SelfObject
            } else {
                ScopeKind::ObjectMember
            };
            self.scopes.insert(
                handle,
                ScopeNode {
                    handle,
                    name,
                    kind,
                    path: prefix.to_vec(),
                    frame_id,
                    parent: Some(parent),
                    expensive: false,
                },
            );
            parent = handle;
        }
        Ok(parent)
    }

    /// Scope chain for everything but the leaf segment.
    pub fn get_or_create_parent_scope(
        &mut self,
        root: Root,
        frame_id: Option<i64>,
        path: &[String],
    ) -> Result<i64, Error> {
        let cut = path.len().saturating_sub(1);
        self.get_or_create_scope(root, frame_id, &path[..cut])
    }

    pub fn insert_variable(
        &mut self,
        name: String,
        value: String,
        type_name: Option<String>,
        parent_scope: i64,
        expandable: bool,
    ) -> i64 {
        let handle = self.alloc();
        self.variables.insert(
            handle,
            VariableNode {
                handle,
                name,
                value,
                type_name,
                parent_scope,
                expandable,
            },
        );
        handle
    }

    /// "In scope" is ownership: a variable belongs to exactly one scope.
    pub fn variables_in_scope(&self, scope_handle: i64) -> impl Iterator<Item = &VariableNode> {
        self.variables
            .values()
            .filter(move |variable| variable.parent_scope == scope_handle)
    }
}

impl Default for HandleTree {
    fn default() -> Self {
        HandleTree::new()
    }
}
