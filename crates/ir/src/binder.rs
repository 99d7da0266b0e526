//! Symbolic argument slot assignment.

use crate::dialect::ResourceId;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};

/// Whether identical resources across statements share one argument slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum BindingPolicy {
    /// Occurrences of the same resource collapse to one slot.
    #[default]
    AliasByIdentity,
    /// Every occurrence gets its own slot.
    Independent,
}

impl BindingPolicy {
    pub fn code(&self) -> &'static str {
        match self {
            BindingPolicy::AliasByIdentity => "a",
            BindingPolicy::Independent => "u",
        }
    }
}

pub trait SymbolicBinder {
    /// Returns true the first time a resource needs runtime arguments.
    fn bind(&mut self, id: ResourceId) -> bool;

    /// Slot index for a resource occurrence.
    fn get(&mut self, id: ResourceId) -> u32;
}

#[derive(Debug, Default)]
pub struct IdentityBinder {
    slots: HashMap<ResourceId, u32>,
    bound: HashSet<ResourceId>,
}

impl SymbolicBinder for IdentityBinder {
    fn bind(&mut self, id: ResourceId) -> bool {
        self.bound.insert(id)
    }

    fn get(&mut self, id: ResourceId) -> u32 {
        let next = self.slots.len() as u32;
        *self.slots.entry(id).or_insert(next)
    }
}

#[derive(Debug, Default)]
pub struct IndependentBinder {
    next: u32,
}

impl SymbolicBinder for IndependentBinder {
    fn bind(&mut self, _id: ResourceId) -> bool {
        true
    }

    fn get(&mut self, _id: ResourceId) -> u32 {
        let slot = self.next;
        self.next += 1;
        slot
    }
}

pub fn make_binder(policy: BindingPolicy) -> Box<dyn SymbolicBinder> {
    match policy {
        BindingPolicy::AliasByIdentity => Box::<IdentityBinder>::default(),
        BindingPolicy::Independent => Box::<IndependentBinder>::default(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identity_binder_reuses_slots() {
        let mut binder = make_binder(BindingPolicy::AliasByIdentity);
        assert_eq!(binder.get(ResourceId(7)), 0);
        assert_eq!(binder.get(ResourceId(3)), 1);
        assert_eq!(binder.get(ResourceId(7)), 0);
        assert!(binder.bind(ResourceId(7)));
        assert!(!binder.bind(ResourceId(7)));
    }

    #[test]
    fn independent_binder_never_aliases() {
        let mut binder = make_binder(BindingPolicy::Independent);
        assert_eq!(binder.get(ResourceId(7)), 0);
        assert_eq!(binder.get(ResourceId(7)), 1);
        assert!(binder.bind(ResourceId(7)));
        assert!(binder.bind(ResourceId(7)));
    }
}
