//! Validity tracking shared by every object the filesystem hands out.
//!
//! Each directory, file and entry holds an `Rc<Liveness>`. A node is alive
//! while its own flag and every ancestor's flag are set, so flipping one
//! directory's flag retires the whole subtree below it without the children
//! having to be reachable from the parent.
use alloc::collections::BTreeMap;
use alloc::rc::{Rc, Weak};
use core::cell::Cell;

use crate::FsError;

pub(crate) struct Liveness {
    alive:  Cell<bool>,
    parent: Option<Rc<Liveness>>,
}

impl Liveness {
    pub(crate) fn root() -> Rc<Self> {
        Rc::new(Self { alive: Cell::new(true), parent: None })
    }

    pub(crate) fn child(parent: &Rc<Liveness>) -> Rc<Self> {
        Rc::new(Self { alive: Cell::new(true), parent: Some(parent.clone()) })
    }

    pub(crate) fn is_alive(&self) -> bool {
        let mut node = self;
        loop {
            if !node.alive.get() {
                return false;
            }
            match &node.parent {
                Some(parent) => node = parent.as_ref(),
                None => return true,
            }
        }
    }

    /// One-way: a retired node never comes back.
    pub(crate) fn invalidate(&self) {
        self.alive.set(false);
    }
}

// ─── Guard ─────────────────────────────────────────────────────────────────────

#[derive(Clone)]
pub(crate) struct Guard {
    liveness:  Rc<Liveness>,
    read_only: bool,
}

impl Guard {
    pub(crate) fn new(liveness: Rc<Liveness>, read_only: bool) -> Self {
        Self { liveness, read_only }
    }

    pub(crate) fn liveness(&self) -> &Rc<Liveness> { &self.liveness }

    pub(crate) fn read_only(&self) -> bool { self.read_only }

    pub(crate) fn is_valid(&self) -> bool { self.liveness.is_alive() }

    pub(crate) fn check_valid(&self) -> Result<(), FsError> {
        if self.liveness.is_alive() { Ok(()) } else { Err(FsError::InvalidState) }
    }

    pub(crate) fn check_writable(&self) -> Result<(), FsError> {
        self.check_valid()?;
        if self.read_only { Err(FsError::ReadOnly) } else { Ok(()) }
    }
}

// ─── Registry ──────────────────────────────────────────────────────────────────

/// Maps the device offset of an entry's short record to the liveness of the
/// handles currently open on it, so two lookups of the same entry share one
/// flag and removal can retire it.
#[derive(Default)]
pub(crate) struct Registry {
    nodes: BTreeMap<u64, Weak<Liveness>>,
}

const PRUNE_THRESHOLD: usize = 256;

impl Registry {
    /// Liveness for the entry at `record_pos` inside the directory guarded by
    /// `parent`. A stale node (dropped, or retired together with an old
    /// directory that used the same clusters) is replaced.
    pub(crate) fn node_for(&mut self, record_pos: u64, parent: &Rc<Liveness>) -> Rc<Liveness> {
        if let Some(node) = self.nodes.get(&record_pos).and_then(Weak::upgrade) {
            if node.is_alive() {
                return node;
            }
        }
        if self.nodes.len() >= PRUNE_THRESHOLD {
            self.nodes.retain(|_, w| w.strong_count() > 0);
        }
        let node = Liveness::child(parent);
        self.nodes.insert(record_pos, Rc::downgrade(&node));
        node
    }

    /// Retire the entry at `record_pos`, if anything still refers to it.
    pub(crate) fn retire(&mut self, record_pos: u64) {
        if let Some(node) = self.nodes.remove(&record_pos).and_then(|w| w.upgrade()) {
            node.invalidate();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn child_dies_with_ancestor() {
        let root = Liveness::root();
        let dir = Liveness::child(&root);
        let file = Liveness::child(&dir);
        assert!(file.is_alive());
        dir.invalidate();
        assert!(!file.is_alive());
        assert!(root.is_alive());
    }

    #[test]
    fn guard_checks_validity_before_read_only() {
        let root = Liveness::root();
        let guard = Guard::new(root.clone(), true);
        assert_eq!(guard.check_valid(), Ok(()));
        assert_eq!(guard.check_writable(), Err(FsError::ReadOnly));
        root.invalidate();
        assert_eq!(guard.check_writable(), Err(FsError::InvalidState));
    }

    #[test]
    fn registry_shares_and_retires_nodes() {
        let root = Liveness::root();
        let mut reg = Registry::default();
        let a = reg.node_for(0x4000, &root);
        let b = reg.node_for(0x4000, &root);
        assert!(Rc::ptr_eq(&a, &b));
        reg.retire(0x4000);
        assert!(!a.is_alive());
        let fresh = reg.node_for(0x4000, &root);
        assert!(fresh.is_alive());
        assert!(!Rc::ptr_eq(&a, &fresh));
    }
}
