//! Nodes of the reverse map.
//!
//! Nodes live in an arena owned by the `MemoryMap`; tree edges are indexes.
//! Names are interned process-wide, since the same member names repeat
//! across millions of nodes.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use lazy_static::lazy_static;

use crate::instance::Instance;
use crate::symbols::TypeId;

pub type NodeId = usize;

lazy_static! {
    static ref NAMES: Mutex<HashSet<Arc<str>>> = Mutex::new(HashSet::new());
}

/// Returns the canonical shared copy of `name`.
pub fn intern_name(name: &str) -> Arc<str> {
    let mut names = match NAMES.lock() {
        Ok(g) => g,
        Err(p) => p.into_inner(),
    };
    if let Some(existing) = names.get(name) {
        return existing.clone();
    }
    let arc: Arc<str> = Arc::from(name);
    names.insert(arc.clone());
    arc
}

#[derive(Debug, Clone)]
pub struct MemoryMapNode {
    pub name: Arc<str>,
    pub address: u64,
    pub type_id: TypeId,
    pub type_hash: u32,
    /// Byte size of the viewed type, snapshotted at creation.
    pub size: u64,
    pub probability: f32,
    pub parent: Option<NodeId>,
    pub children: Vec<NodeId>,
    pub seems_valid: bool,
    pub found_in_ptr_chains: u32,
    /// Variable id for roots, -1 below.
    pub id: i32,
}

impl MemoryMapNode {
    /// Derives the display name of a child node from its instance: the
    /// parent's leading components are stripped, array suffixes keep the
    /// parent name glued in front.
    pub fn derive_name(parent_name: Option<&str>, inst: &Instance<'_>) -> Arc<str> {
        let mut names = inst.full_name_components();
        if let Some(parent) = parent_name.filter(|p| !p.is_empty()) {
            let array_suffix = format!("{parent}[");
            match names.first_mut() {
                // Array children keep the bracket part glued to the name.
                Some(first) if first.starts_with(&array_suffix) => {
                    *first = first[parent.len()..].to_owned();
                }
                _ => {
                    // Pop leading components up to and including the one
                    // the parent node already accounts for.
                    while let Some(first) = names.first() {
                        let is_parent =
                            parent == first || parent.ends_with(&format!(".{first}"));
                        names.remove(0);
                        if is_parent {
                            break;
                        }
                    }
                }
            }
        }
        intern_name(&names.join("."))
    }

    pub fn end_address(&self, vaddr_space_end: u64) -> u64 {
        if self.size > 0 {
            if vaddr_space_end - self.size <= self.address {
                vaddr_space_end
            } else {
                self.address + self.size - 1
            }
        } else {
            self.address
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn interner_returns_shared_copies() {
        let a = intern_name("tasks");
        let b = intern_name("tasks");
        assert!(Arc::ptr_eq(&a, &b));
        assert_ne!(intern_name("next").as_ref(), a.as_ref());
    }
}
