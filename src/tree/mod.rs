//! B-tree (C6, `spec.md` §4.6): node encoding, large-value fragmentation,
//! and the cursor contract, wired together as a self-contained module.

pub mod cursor;
pub mod fragment;
pub mod node;

pub use cursor::{BTree, Cursor};
pub use node::{Entry, Node, NodeType, ValueRepr};
