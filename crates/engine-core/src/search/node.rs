//! Search nodes and the progressive children-capacity ladder.
//!
//! A node's children live in one of three fixed-capacity arrays. The
//! `state` machine dictates which array is current:
//!
//! `UNEVALUATED -> EVALUATING -> EXPANDED0 -> GROWING1 -> EXPANDED1
//!  -> GROWING2 -> EXPANDED2`
//!
//! Growth CASes `EXPANDEDk -> GROWINGk+1`, copies the old slots into a
//! thread-private larger array with relaxed ordering, publishes the array,
//! then release-stores `EXPANDEDk+1`. Readers that loaded an older state
//! keep using the older array; old arrays are freed only when the node is
//! destroyed, under sweep quiescence.

use std::sync::atomic::{AtomicI32, AtomicPtr, AtomicU32, Ordering};
use std::sync::Arc;

use crate::eval::NnOutput;
use crate::types::{Hash128, NnPos, Player};

use super::child_pointer::SearchChildPointer;
use super::stats::{AtomicF64, NodeStatsAtomic};
use super::value_bias::ValueBiasEntry;

pub const CHILDREN0_SIZE: usize = 8;
pub const CHILDREN1_SIZE: usize = 64;
pub const CHILDREN2_SIZE: usize = NnPos::MAX_POLICY_SIZE;

pub const STATE_UNEVALUATED: u32 = 0;
pub const STATE_EVALUATING: u32 = 1;
pub const STATE_EXPANDED0: u32 = 2;
pub const STATE_GROWING1: u32 = 3;
pub const STATE_EXPANDED1: u32 = 4;
pub const STATE_GROWING2: u32 = 5;
pub const STATE_EXPANDED2: u32 = 6;

/// A test-and-set spin flag guarding multi-field stat publication.
#[derive(Debug, Default)]
pub struct SpinFlag {
    flag: std::sync::atomic::AtomicBool,
}

impl SpinFlag {
    #[inline]
    pub fn lock(&self) {
        while self.flag.swap(true, Ordering::Acquire) {
            std::hint::spin_loop();
        }
    }

    #[inline]
    pub fn unlock(&self) {
        self.flag.store(false, Ordering::Release);
    }
}

pub struct SearchNode {
    pub next_pla: Player,
    /// The root and the conservative-pass child of the root must not be
    /// treated as terminal even when the history says the game ended.
    pub force_non_terminal: bool,
    pub pattern_bonus_hash: Hash128,
    /// Index into the shared mutex pool used for child-slot publication.
    pub mutex_idx: u32,

    state: AtomicU32,
    nn_output: AtomicPtr<Arc<NnOutput>>,
    pub node_age: AtomicU32,

    children0: AtomicPtr<SearchChildPointer>,
    children1: AtomicPtr<SearchChildPointer>,
    children2: AtomicPtr<SearchChildPointer>,

    pub stats: NodeStatsAtomic,
    pub stats_lock: SpinFlag,
    pub virtual_losses: AtomicI32,
    pub dirty_counter: AtomicI32,

    pub subtree_value_bias_entry: Option<Arc<ValueBiasEntry>>,
    pub last_subtree_value_bias_delta_sum: AtomicF64,
    pub last_subtree_value_bias_weight: AtomicF64,
}

// Raw child pointers and the nn-output handle are managed under the
// table/sweep ownership protocol; all other fields are atomics or immutable.
unsafe impl Send for SearchNode {}
unsafe impl Sync for SearchNode {}

fn alloc_children_array(capacity: usize) -> *mut SearchChildPointer {
    let boxed: Box<[SearchChildPointer]> =
        (0..capacity).map(|_| SearchChildPointer::new()).collect();
    Box::into_raw(boxed) as *mut SearchChildPointer
}

unsafe fn free_children_array(ptr: *mut SearchChildPointer, capacity: usize) {
    if !ptr.is_null() {
        drop(Box::from_raw(std::ptr::slice_from_raw_parts_mut(ptr, capacity)));
    }
}

impl SearchNode {
    pub fn new(next_pla: Player, force_non_terminal: bool, mutex_idx: u32) -> SearchNode {
        SearchNode {
            next_pla,
            force_non_terminal,
            pattern_bonus_hash: Hash128::ZERO,
            mutex_idx,
            state: AtomicU32::new(STATE_UNEVALUATED),
            nn_output: AtomicPtr::new(std::ptr::null_mut()),
            node_age: AtomicU32::new(0),
            children0: AtomicPtr::new(std::ptr::null_mut()),
            children1: AtomicPtr::new(std::ptr::null_mut()),
            children2: AtomicPtr::new(std::ptr::null_mut()),
            stats: NodeStatsAtomic::new(),
            stats_lock: SpinFlag::default(),
            virtual_losses: AtomicI32::new(0),
            dirty_counter: AtomicI32::new(0),
            subtree_value_bias_entry: None,
            last_subtree_value_bias_delta_sum: AtomicF64::new(0.0),
            last_subtree_value_bias_weight: AtomicF64::new(0.0),
        }
    }

    /// Detached copy used to promote a child to the root. The value-bias
    /// entry is intentionally not copied: the original node still owns its
    /// contribution and will subtract it when deleted.
    pub fn detached_copy(other: &SearchNode, force_non_terminal: bool) -> SearchNode {
        let node = SearchNode::new(other.next_pla, force_non_terminal, other.mutex_idx);
        node.state
            .store(other.state.load(Ordering::Acquire), Ordering::Release);
        node.node_age
            .store(other.node_age.load(Ordering::Acquire), Ordering::Release);
        if let Some(nn) = other.nn_output_handle() {
            let boxed: Box<Arc<NnOutput>> = Box::new(nn.clone());
            node.nn_output.store(Box::into_raw(boxed), Ordering::Release);
        }
        node.stats.copy_from(&other.stats);
        node.virtual_losses
            .store(other.virtual_losses.load(Ordering::Acquire), Ordering::Release);
        node.dirty_counter
            .store(other.dirty_counter.load(Ordering::Acquire), Ordering::Release);

        let copy_array = |src: &AtomicPtr<SearchChildPointer>,
                          dst: &AtomicPtr<SearchChildPointer>,
                          capacity: usize| {
            let p = src.load(Ordering::Acquire);
            if p.is_null() {
                return;
            }
            let arr = alloc_children_array(capacity);
            let src_slice = unsafe { std::slice::from_raw_parts(p, capacity) };
            let dst_slice = unsafe { std::slice::from_raw_parts(arr, capacity) };
            for (d, s) in dst_slice.iter().zip(src_slice.iter()) {
                d.store_all(s);
            }
            dst.store(arr, Ordering::Release);
        };
        copy_array(&other.children0, &node.children0, CHILDREN0_SIZE);
        copy_array(&other.children1, &node.children1, CHILDREN1_SIZE);
        copy_array(&other.children2, &node.children2, CHILDREN2_SIZE);

        // A fresh pattern-bonus context applies at the new root.
        let mut node = node;
        node.pattern_bonus_hash = other.pattern_bonus_hash;
        node
    }

    #[inline]
    pub fn state(&self) -> u32 {
        self.state.load(Ordering::Acquire)
    }

    pub fn cas_state(&self, expected: u32, desired: u32) -> bool {
        self.state
            .compare_exchange(expected, desired, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    pub fn store_state(&self, value: u32) {
        self.state.store(value, Ordering::SeqCst);
    }

    pub fn children_capacity(state_value: u32) -> usize {
        if state_value >= STATE_EXPANDED2 {
            CHILDREN2_SIZE
        } else if state_value >= STATE_EXPANDED1 {
            CHILDREN1_SIZE
        } else if state_value >= STATE_EXPANDED0 {
            CHILDREN0_SIZE
        } else {
            0
        }
    }

    /// The children array current as of `state_value`. Empty before
    /// `EXPANDED0`.
    pub fn children_for_state(&self, state_value: u32) -> &[SearchChildPointer] {
        let (ptr, cap) = if state_value >= STATE_EXPANDED2 {
            (self.children2.load(Ordering::Acquire), CHILDREN2_SIZE)
        } else if state_value >= STATE_EXPANDED1 {
            (self.children1.load(Ordering::Acquire), CHILDREN1_SIZE)
        } else if state_value >= STATE_EXPANDED0 {
            (self.children0.load(Ordering::Acquire), CHILDREN0_SIZE)
        } else {
            (std::ptr::null_mut(), 0)
        };
        if ptr.is_null() {
            &[]
        } else {
            unsafe { std::slice::from_raw_parts(ptr, cap) }
        }
    }

    pub fn children(&self) -> &[SearchChildPointer] {
        self.children_for_state(self.state())
    }

    /// Count the prefix of allocated slots.
    pub fn count_children_in(children: &[SearchChildPointer]) -> usize {
        let mut n = 0;
        for slot in children {
            if slot.get_if_allocated().is_none() {
                break;
            }
            n += 1;
        }
        n
    }

    pub fn count_children(&self) -> usize {
        Self::count_children_in(self.children())
    }

    /// Called once by the thread that won the `EVALUATING` CAS.
    pub fn initialize_children(&self) {
        debug_assert!(self.children0.load(Ordering::Acquire).is_null());
        self.children0
            .store(alloc_children_array(CHILDREN0_SIZE), Ordering::Release);
    }

    /// Ensure capacity for a new child at index `num_children_full_plus_one - 1`.
    ///
    /// Returns false (`Busy`) when another thread is mid-growth; the caller
    /// re-reads the state and retries. On success `state_value` is updated
    /// to a state whose array has room.
    pub fn maybe_expand_children_capacity_for_new_child(
        &self,
        state_value: &mut u32,
        num_children_full_plus_one: usize,
    ) -> bool {
        let capacity = Self::children_capacity(*state_value);
        if capacity < num_children_full_plus_one {
            debug_assert!(capacity == num_children_full_plus_one - 1);
            return self.try_expanding_children_capacity_assume_full(state_value);
        }
        true
    }

    fn try_expanding_children_capacity_assume_full(&self, state_value: &mut u32) -> bool {
        if *state_value < STATE_EXPANDED1 {
            if *state_value == STATE_GROWING1 {
                return false;
            }
            debug_assert_eq!(*state_value, STATE_EXPANDED0);
            if self
                .state
                .compare_exchange(*state_value, STATE_GROWING1, Ordering::AcqRel, Ordering::Acquire)
                .is_err()
            {
                return false;
            }
            *state_value = STATE_GROWING1;

            let new_arr = alloc_children_array(CHILDREN1_SIZE);
            let new_slice = unsafe { std::slice::from_raw_parts(new_arr, CHILDREN1_SIZE) };
            let old_ptr = self.children0.load(Ordering::Acquire);
            let old = unsafe { std::slice::from_raw_parts(old_ptr, CHILDREN0_SIZE) };
            for (dst, src) in new_slice.iter().zip(old.iter()) {
                // Relaxed is fine: the caller already acquire-observed every
                // slot as full, and the new array is still thread-private.
                let child = src.get_if_allocated_relaxed();
                debug_assert!(child.is_some());
                dst.store_relaxed(child.map_or(std::ptr::null_mut(), |c| c as *const _ as *mut _));
                dst.set_edge_visits_relaxed(src.edge_visits_relaxed());
                dst.set_move_loc_relaxed(src.move_loc_relaxed());
            }
            debug_assert!(self.children1.load(Ordering::Acquire).is_null());
            self.children1.store(new_arr, Ordering::Release);
            self.state.store(STATE_EXPANDED1, Ordering::Release);
            *state_value = STATE_EXPANDED1;
        } else if *state_value < STATE_EXPANDED2 {
            if *state_value == STATE_GROWING2 {
                return false;
            }
            debug_assert_eq!(*state_value, STATE_EXPANDED1);
            if self
                .state
                .compare_exchange(*state_value, STATE_GROWING2, Ordering::AcqRel, Ordering::Acquire)
                .is_err()
            {
                return false;
            }
            *state_value = STATE_GROWING2;

            let new_arr = alloc_children_array(CHILDREN2_SIZE);
            let new_slice = unsafe { std::slice::from_raw_parts(new_arr, CHILDREN2_SIZE) };
            let old_ptr = self.children1.load(Ordering::Acquire);
            let old = unsafe { std::slice::from_raw_parts(old_ptr, CHILDREN1_SIZE) };
            for (dst, src) in new_slice.iter().zip(old.iter()) {
                let child = src.get_if_allocated_relaxed();
                debug_assert!(child.is_some());
                dst.store_relaxed(child.map_or(std::ptr::null_mut(), |c| c as *const _ as *mut _));
                dst.set_edge_visits_relaxed(src.edge_visits_relaxed());
                dst.set_move_loc_relaxed(src.move_loc_relaxed());
            }
            debug_assert!(self.children2.load(Ordering::Acquire).is_null());
            self.children2.store(new_arr, Ordering::Release);
            self.state.store(STATE_EXPANDED2, Ordering::Release);
            *state_value = STATE_EXPANDED2;
        } else {
            unreachable!("children capacity is already at maximum");
        }
        true
    }

    /// Drop the smaller arrays after root filtering, where explicit
    /// happens-before with quiesced threads makes it safe.
    pub fn free_unused_smaller_arrays(&self) {
        let state = self.state();
        if state >= STATE_EXPANDED2 {
            unsafe {
                free_children_array(self.children1.swap(std::ptr::null_mut(), Ordering::AcqRel), CHILDREN1_SIZE);
                free_children_array(self.children0.swap(std::ptr::null_mut(), Ordering::AcqRel), CHILDREN0_SIZE);
            }
        } else if state >= STATE_EXPANDED1 {
            unsafe {
                free_children_array(self.children0.swap(std::ptr::null_mut(), Ordering::AcqRel), CHILDREN0_SIZE);
            }
        }
    }

    #[inline]
    pub fn nn_output_handle(&self) -> Option<&Arc<NnOutput>> {
        let p = self.nn_output.load(Ordering::Acquire);
        if p.is_null() {
            None
        } else {
            Some(unsafe { &*p })
        }
    }

    #[inline]
    pub fn nn_output(&self) -> Option<Arc<NnOutput>> {
        self.nn_output_handle().cloned()
    }

    /// Replace the nn output. The old handle, if any, goes onto the caller's
    /// deferred cleanup list since other threads may still be reading it.
    /// Returns true if there was no previous output.
    pub fn store_nn_output(
        &self,
        new_output: Box<Arc<NnOutput>>,
        cleanup: &mut Vec<Box<Arc<NnOutput>>>,
    ) -> bool {
        let old = self.nn_output.swap(Box::into_raw(new_output), Ordering::AcqRel);
        if old.is_null() {
            true
        } else {
            cleanup.push(unsafe { Box::from_raw(old) });
            false
        }
    }

    /// First-writer-wins install. On failure the new output is returned to
    /// the caller to drop.
    pub fn store_nn_output_if_null(
        &self,
        new_output: Box<Arc<NnOutput>>,
    ) -> Result<(), Box<Arc<NnOutput>>> {
        let raw = Box::into_raw(new_output);
        match self.nn_output.compare_exchange(
            std::ptr::null_mut(),
            raw,
            Ordering::AcqRel,
            Ordering::Acquire,
        ) {
            Ok(_) => Ok(()),
            Err(_) => Err(unsafe { Box::from_raw(raw) }),
        }
    }
}

impl Drop for SearchNode {
    fn drop(&mut self) {
        // Children are never freed recursively; the table owns the nodes.
        unsafe {
            free_children_array(self.children2.load(Ordering::Relaxed), CHILDREN2_SIZE);
            free_children_array(self.children1.load(Ordering::Relaxed), CHILDREN1_SIZE);
            free_children_array(self.children0.load(Ordering::Relaxed), CHILDREN0_SIZE);
            let nn = self.nn_output.load(Ordering::Relaxed);
            if !nn.is_null() {
                drop(Box::from_raw(nn));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn full_prefix(node: &SearchNode, fakes: &[Box<SearchNode>], n: usize) {
        let state = node.state();
        let children = node.children_for_state(state);
        for i in 0..n {
            children[i].set_move_loc_relaxed(crate::types::Loc(i as u16));
            children[i].store(&*fakes[i] as *const SearchNode as *mut SearchNode);
        }
    }

    fn make_fakes(n: usize) -> Vec<Box<SearchNode>> {
        (0..n)
            .map(|_| Box::new(SearchNode::new(Player::White, false, 0)))
            .collect()
    }

    #[test]
    fn test_state_ladder_capacities() {
        assert_eq!(SearchNode::children_capacity(STATE_UNEVALUATED), 0);
        assert_eq!(SearchNode::children_capacity(STATE_EVALUATING), 0);
        assert_eq!(SearchNode::children_capacity(STATE_EXPANDED0), CHILDREN0_SIZE);
        assert_eq!(SearchNode::children_capacity(STATE_GROWING1), CHILDREN0_SIZE);
        assert_eq!(SearchNode::children_capacity(STATE_EXPANDED1), CHILDREN1_SIZE);
        assert_eq!(SearchNode::children_capacity(STATE_GROWING2), CHILDREN1_SIZE);
        assert_eq!(SearchNode::children_capacity(STATE_EXPANDED2), CHILDREN2_SIZE);
    }

    #[test]
    fn test_growth_preserves_children() {
        let node = SearchNode::new(Player::Black, true, 0);
        assert!(node.cas_state(STATE_UNEVALUATED, STATE_EVALUATING));
        node.initialize_children();
        node.store_state(STATE_EXPANDED0);

        let fakes = make_fakes(CHILDREN0_SIZE);
        full_prefix(&node, &fakes, CHILDREN0_SIZE);
        for (i, slot) in node.children().iter().enumerate() {
            slot.set_edge_visits(i as i64 + 1);
        }

        let mut state = node.state();
        assert!(node.maybe_expand_children_capacity_for_new_child(&mut state, CHILDREN0_SIZE + 1));
        assert_eq!(state, STATE_EXPANDED1);
        assert_eq!(node.state(), STATE_EXPANDED1);

        let children = node.children();
        assert_eq!(children.len(), CHILDREN1_SIZE);
        for i in 0..CHILDREN0_SIZE {
            assert!(children[i].get_if_allocated().is_some());
            assert_eq!(children[i].edge_visits(), i as i64 + 1);
            assert_eq!(children[i].move_loc(), crate::types::Loc(i as u16));
        }
        assert!(children[CHILDREN0_SIZE].get_if_allocated().is_none());
        assert_eq!(node.count_children(), CHILDREN0_SIZE);

        // The old array is still readable for stale-state readers.
        let old = node.children_for_state(STATE_EXPANDED0);
        assert_eq!(old.len(), CHILDREN0_SIZE);
        assert!(old[0].get_if_allocated().is_some());
    }

    #[test]
    fn test_no_growth_when_capacity_suffices() {
        let node = SearchNode::new(Player::Black, false, 0);
        node.initialize_children();
        node.store_state(STATE_EXPANDED0);
        let mut state = node.state();
        assert!(node.maybe_expand_children_capacity_for_new_child(&mut state, 3));
        assert_eq!(state, STATE_EXPANDED0);
    }

    #[test]
    fn test_growth_busy_when_mid_growth() {
        let node = SearchNode::new(Player::Black, false, 0);
        node.initialize_children();
        node.store_state(STATE_GROWING1);
        let mut state = STATE_GROWING1;
        assert!(!node.maybe_expand_children_capacity_for_new_child(&mut state, CHILDREN0_SIZE + 1));
    }

    #[test]
    fn test_nn_output_first_writer_wins() {
        let node = SearchNode::new(Player::Black, false, 0);
        let out = Box::new(Arc::new(crate::eval::NnOutput {
            policy_probs: vec![1.0],
            white_win_prob: 0.5,
            white_loss_prob: 0.5,
            white_no_result_prob: 0.0,
            white_score_mean: 0.0,
            white_score_mean_sq: 0.0,
            white_lead: 0.0,
            white_owner_map: None,
            shortterm_winloss_error: 0.0,
            shortterm_score_error: 0.0,
            nn_hash: Hash128::ZERO,
            noised_policy_probs: None,
        }));
        let out2 = out.clone();
        assert!(node.store_nn_output_if_null(out).is_ok());
        assert!(node.store_nn_output_if_null(out2).is_err());
        assert!(node.nn_output().is_some());

        // Replacement defers the old handle to the cleanup list.
        let replacement = Box::new(node.nn_output().unwrap());
        let mut cleanup = Vec::new();
        assert!(!node.store_nn_output(replacement, &mut cleanup));
        assert_eq!(cleanup.len(), 1);
    }
}
