//! Typed CRDT operations and the change-set builder that turns a mutation into
//! triple writes under an entity.
//!
//! Registers are last-writer-wins on their root path. A Set is a map of
//! `serialize(member) -> bool` slots, each slot its own LWW register. Adds and
//! removes of different members commute; an add and a remove of the same member
//! resolve by timestamp alone, so a remove can lose to an add that carries a
//! later timestamp even if it was issued causally earlier. This is per-member
//! LWW, not an observed-remove set.

use crate::document::Document;
use crate::path::AttributePath;
use crate::value::Value;

/// One path write produced by an operation; stamped with the transaction
/// timestamp when committed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Write {
    pub attribute: AttributePath,
    pub value: Value,
    pub expired: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CrdtOp {
    RegisterSet { path: AttributePath, value: Value },
    SetAdd { path: AttributePath, member: Value },
    SetRemove { path: AttributePath, member: Value },
    Delete { path: AttributePath },
}

impl CrdtOp {
    pub fn path(&self) -> &AttributePath {
        match self {
            CrdtOp::RegisterSet { path, .. }
            | CrdtOp::SetAdd { path, .. }
            | CrdtOp::SetRemove { path, .. }
            | CrdtOp::Delete { path } => path,
        }
    }

    pub fn to_write(&self) -> Write {
        match self {
            CrdtOp::RegisterSet { path, value } => Write {
                attribute: path.clone(),
                value: value.clone(),
                expired: false,
            },
            CrdtOp::SetAdd { path, member } => Write {
                attribute: path.child(member.set_key()),
                value: Value::Boolean(true),
                expired: false,
            },
            CrdtOp::SetRemove { path, member } => Write {
                attribute: path.child(member.set_key()),
                value: Value::Boolean(false),
                expired: false,
            },
            CrdtOp::Delete { path } => Write {
                attribute: path.clone(),
                value: Value::Null,
                expired: true,
            },
        }
    }
}

/// Last-writer-wins scalar.
pub struct Register;

impl Register {
    pub fn set(path: impl Into<AttributePath>, value: impl Into<Value>) -> CrdtOp {
        CrdtOp::RegisterSet {
            path: path.into(),
            value: value.into(),
        }
    }
}

/// Per-member LWW set.
pub struct Set;

impl Set {
    pub fn add(path: impl Into<AttributePath>, member: impl Into<Value>) -> CrdtOp {
        CrdtOp::SetAdd {
            path: path.into(),
            member: member.into(),
        }
    }

    pub fn remove(path: impl Into<AttributePath>, member: impl Into<Value>) -> CrdtOp {
        CrdtOp::SetRemove {
            path: path.into(),
            member: member.into(),
        }
    }
}

/// Explicit change tracker for an update: callers record what they change and
/// the set of `(path, value)` writes falls out.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChangeSet {
    ops: Vec<CrdtOp>,
}

impl ChangeSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&mut self, path: impl Into<AttributePath>, value: impl Into<Value>) -> &mut Self {
        self.ops.push(Register::set(path, value));
        self
    }

    /// Replace a subtree: tombstone the path, then write every leaf of `doc`.
    /// Sets inside `doc` become member adds.
    pub fn assign(&mut self, path: impl Into<AttributePath>, doc: &Document) -> &mut Self {
        let path = path.into();
        match doc {
            Document::Value(v) => {
                self.ops.push(Register::set(path, v.clone()));
            }
            _ => {
                self.ops.push(CrdtOp::Delete { path: path.clone() });
                let mut leaves = Vec::new();
                doc.flatten(&path, &mut leaves);
                for (leaf_path, value) in leaves {
                    self.ops.push(CrdtOp::RegisterSet {
                        path: leaf_path,
                        value,
                    });
                }
            }
        }
        self
    }

    pub fn add(&mut self, path: impl Into<AttributePath>, member: impl Into<Value>) -> &mut Self {
        self.ops.push(Set::add(path, member));
        self
    }

    pub fn remove(&mut self, path: impl Into<AttributePath>, member: impl Into<Value>) -> &mut Self {
        self.ops.push(Set::remove(path, member));
        self
    }

    pub fn delete(&mut self, path: impl Into<AttributePath>) -> &mut Self {
        self.ops.push(CrdtOp::Delete { path: path.into() });
        self
    }

    pub fn push(&mut self, op: CrdtOp) -> &mut Self {
        self.ops.push(op);
        self
    }

    pub fn ops(&self) -> &[CrdtOp] {
        &self.ops
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    /// Writes in recording order. A later write to the same path replaces an
    /// earlier one, since both would carry the same timestamp.
    pub fn into_writes(self) -> Vec<Write> {
        let mut writes: Vec<Write> = Vec::with_capacity(self.ops.len());
        for op in &self.ops {
            let write = op.to_write();
            writes.retain(|w| w.attribute != write.attribute);
            writes.push(write);
        }
        writes
    }
}
