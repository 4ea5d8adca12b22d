//! One child slot of a node: an atomic edge.
//!
//! The slot publishes three things: the move, the edge visit count, and the
//! child pointer. `store_all` and the slot-publication path write the move
//! and edge visits before release-storing the pointer, so any thread that
//! acquire-loads a non-null pointer also observes a valid move and edge
//! count. Under graph search the edge visits are deliberately distinct from
//! the child node's own visits.

use std::sync::atomic::{AtomicI64, AtomicPtr, AtomicU16, Ordering};

use crate::types::Loc;

use super::node::SearchNode;

pub struct SearchChildPointer {
    data: AtomicPtr<SearchNode>,
    edge_visits: AtomicI64,
    move_loc: AtomicU16,
}

impl Default for SearchChildPointer {
    fn default() -> SearchChildPointer {
        SearchChildPointer {
            data: AtomicPtr::new(std::ptr::null_mut()),
            edge_visits: AtomicI64::new(0),
            move_loc: AtomicU16::new(Loc::NULL.0),
        }
    }
}

impl SearchChildPointer {
    pub fn new() -> SearchChildPointer {
        SearchChildPointer::default()
    }

    /// Acquire-load the child, if one has been published.
    ///
    /// The returned reference is valid because nodes are only freed by
    /// mark-and-sweep while no search threads hold child references.
    #[inline]
    pub fn get_if_allocated(&self) -> Option<&SearchNode> {
        let p = self.data.load(Ordering::Acquire);
        if p.is_null() {
            None
        } else {
            Some(unsafe { &*p })
        }
    }

    #[inline]
    pub fn get_if_allocated_relaxed(&self) -> Option<&SearchNode> {
        let p = self.data.load(Ordering::Relaxed);
        if p.is_null() {
            None
        } else {
            Some(unsafe { &*p })
        }
    }

    #[inline]
    pub fn raw_ptr(&self) -> *mut SearchNode {
        self.data.load(Ordering::Acquire)
    }

    #[inline]
    pub fn store(&self, node: *mut SearchNode) {
        self.data.store(node, Ordering::Release);
    }

    #[inline]
    pub fn store_relaxed(&self, node: *mut SearchNode) {
        self.data.store(node, Ordering::Relaxed);
    }

    /// Strong CAS from null. Returns false if some other thread won the slot.
    #[inline]
    pub fn store_if_null(&self, node: *mut SearchNode) -> bool {
        self.data
            .compare_exchange(
                std::ptr::null_mut(),
                node,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }

    #[inline]
    pub fn edge_visits(&self) -> i64 {
        self.edge_visits.load(Ordering::Acquire)
    }

    #[inline]
    pub fn edge_visits_relaxed(&self) -> i64 {
        self.edge_visits.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn set_edge_visits(&self, x: i64) {
        self.edge_visits.store(x, Ordering::Release);
    }

    #[inline]
    pub fn set_edge_visits_relaxed(&self, x: i64) {
        self.edge_visits.store(x, Ordering::Relaxed);
    }

    #[inline]
    pub fn add_edge_visits(&self, delta: i64) {
        self.edge_visits.fetch_add(delta, Ordering::AcqRel);
    }

    /// Weak CAS used by edge-visit catch-up; on failure `expected` is
    /// refreshed with the observed value.
    #[inline]
    pub fn compare_exchange_weak_edge_visits(&self, expected: &mut i64, desired: i64) -> bool {
        match self.edge_visits.compare_exchange_weak(
            *expected,
            desired,
            Ordering::AcqRel,
            Ordering::Acquire,
        ) {
            Ok(_) => true,
            Err(observed) => {
                *expected = observed;
                false
            }
        }
    }

    #[inline]
    pub fn move_loc(&self) -> Loc {
        Loc(self.move_loc.load(Ordering::Acquire))
    }

    #[inline]
    pub fn move_loc_relaxed(&self) -> Loc {
        Loc(self.move_loc.load(Ordering::Relaxed))
    }

    #[inline]
    pub fn set_move_loc(&self, loc: Loc) {
        self.move_loc.store(loc.0, Ordering::Release);
    }

    #[inline]
    pub fn set_move_loc_relaxed(&self, loc: Loc) {
        self.move_loc.store(loc.0, Ordering::Relaxed);
    }

    /// Copy another slot wholesale: move and edge visits first, pointer
    /// last, so a reader of the pointer sees the rest.
    pub fn store_all(&self, other: &SearchChildPointer) {
        let d = other.data.load(Ordering::Acquire);
        let e = other.edge_visits.load(Ordering::Acquire);
        let m = other.move_loc.load(Ordering::Acquire);
        self.move_loc.store(m, Ordering::Release);
        self.edge_visits.store(e, Ordering::Release);
        self.data.store(d, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_slot() {
        let slot = SearchChildPointer::new();
        assert!(slot.get_if_allocated().is_none());
        assert_eq!(slot.edge_visits(), 0);
        assert_eq!(slot.move_loc(), Loc::NULL);
    }

    #[test]
    fn test_store_if_null_wins_once() {
        let slot = SearchChildPointer::new();
        let fake = 0x1000 as *mut SearchNode;
        let fake2 = 0x2000 as *mut SearchNode;
        assert!(slot.store_if_null(fake));
        assert!(!slot.store_if_null(fake2));
        assert_eq!(slot.raw_ptr(), fake);
        // Reset for drop safety: slots never own their pointee.
        slot.store(std::ptr::null_mut());
    }

    #[test]
    fn test_edge_visit_cas() {
        let slot = SearchChildPointer::new();
        slot.set_edge_visits(5);
        let mut expected = 3;
        // Wrong expectation: fails and refreshes.
        assert!(!slot.compare_exchange_weak_edge_visits(&mut expected, 4));
        assert_eq!(expected, 5);
        // compare_exchange_weak may fail spuriously; loop as callers do.
        while !{
            let next = expected + 1;
            slot.compare_exchange_weak_edge_visits(&mut expected, next)
        } {}
        assert_eq!(slot.edge_visits(), 6);
    }
}
