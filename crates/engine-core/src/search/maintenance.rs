//! Recursive tree maintenance: multithreaded post-order and any-order
//! walks, stat recomputation over the whole tree, and mark-and-sweep
//! deletion of stale transposition entries.
//!
//! All of these run only between searches (or with only other maintenance
//! running); `node_age` doubles as the visited marker, compared against the
//! search's generation counter.

use std::collections::HashSet;
use std::sync::atomic::Ordering;

use parking_lot::Mutex;
use rand::{Rng, SeedableRng};
use rand_xoshiro::Xoshiro256PlusPlus;

use super::engine::Search;
use super::node::SearchNode;
use super::thread_ctx::SearchThread;
use super::thread_pool::SearchThreadPool;

/// Root pointers handed to walker tasks.
pub(super) struct NodePtrList(pub Vec<*mut SearchNode>);

unsafe impl Send for NodePtrList {}
unsafe impl Sync for NodePtrList {}

/// Collected const pointers gathered from walker tasks; mirrors
/// `NodePtrList`'s rationale for why sharing raw pointers here is sound.
struct ConstNodePtrVec(Vec<*const SearchNode>);

unsafe impl Send for ConstNodePtrVec {}
unsafe impl Sync for ConstNodePtrVec {}

fn shuffled_range(n: usize, rng: &mut Option<Xoshiro256PlusPlus>) -> Vec<usize> {
    let mut order: Vec<usize> = (0..n).collect();
    if let Some(rng) = rng {
        for i in (1..n).rev() {
            let j = rng.gen_range(0..=i);
            order.swap(i, j);
        }
    }
    order
}

impl Search {
    /// Per-thread walk RNGs: thread 0 walks in order, helpers shuffle so
    /// they spread into different subtrees.
    pub(super) fn make_walk_rngs(&mut self) -> Vec<Mutex<Option<Xoshiro256PlusPlus>>> {
        let n = self.params().num_threads;
        let mut rngs = Vec::with_capacity(n);
        rngs.push(Mutex::new(None));
        for _ in 1..n {
            let seed = self.non_search_rand_next();
            rngs.push(Mutex::new(Some(Xoshiro256PlusPlus::seed_from_u64(seed))));
        }
        rngs
    }

    /// Walk all nodes reachable from `roots`, calling `f` exactly once per
    /// node. With `post_order` every node's descendants are processed
    /// first (cycles are treated as done). Increments the node-age
    /// generation before walking; `node_age == search_node_age` afterwards
    /// exactly for the reachable nodes.
    pub(super) fn walk_tree_multithreaded(
        &mut self,
        roots: NodePtrList,
        post_order: bool,
        f: Option<&(dyn Fn(&SearchNode, usize) + Sync)>,
    ) {
        self.bump_search_node_age();
        let rngs = self.make_walk_rngs();
        self.with_pool(|this, pool| {
            this.dispatch_walk(pool, &roots, &rngs, post_order, f);
        });
    }

    pub(super) fn dispatch_walk(
        &self,
        pool: &SearchThreadPool,
        roots: &NodePtrList,
        rngs: &[Mutex<Option<Xoshiro256PlusPlus>>],
        post_order: bool,
        f: Option<&(dyn Fn(&SearchNode, usize) + Sync)>,
    ) {
        pool.perform_task_with_threads(&|thread_idx| {
            let mut rng = rngs[thread_idx].lock().take();
            let mut node_buf: HashSet<*const SearchNode> = HashSet::new();
            let order = shuffled_range(roots.0.len(), &mut rng);
            for idx in order {
                let node = unsafe { &*roots.0[idx] };
                if post_order {
                    self.post_order_helper(node, thread_idx, &mut rng, &mut node_buf, f);
                } else {
                    self.any_order_helper(node, thread_idx, &mut rng, f);
                }
            }
            *rngs[thread_idx].lock() = rng;
        });
    }

    fn post_order_helper(
        &self,
        node: &SearchNode,
        thread_idx: usize,
        rng: &mut Option<Xoshiro256PlusPlus>,
        node_buf: &mut HashSet<*const SearchNode>,
        f: Option<&(dyn Fn(&SearchNode, usize) + Sync)>,
    ) {
        // node_age == search_node_age means the node is done.
        if node.node_age.load(Ordering::Acquire) == self.search_node_age() {
            return;
        }
        // Cycle: consider the node done.
        if node_buf.contains(&(node as *const SearchNode)) {
            return;
        }

        let children = node.children();
        let num_children = SearchNode::count_children_in(children);
        if num_children > 0 {
            node_buf.insert(node as *const SearchNode);
            let order = shuffled_range(num_children, rng);
            for idx in order {
                let child = children[idx]
                    .get_if_allocated()
                    .expect("counted children must be allocated");
                self.post_order_helper(child, thread_idx, rng, node_buf, f);
            }
            node_buf.remove(&(node as *const SearchNode));
        }

        // The per-node mutex serializes the callback with racing walkers.
        let _guard = self.mutex_pool().mutex(node.mutex_idx).lock();
        if node.node_age.load(Ordering::Acquire) == self.search_node_age() {
            return;
        }
        if let Some(f) = f {
            f(node, thread_idx);
        }
        node.node_age.store(self.search_node_age(), Ordering::Release);
    }

    fn any_order_helper(
        &self,
        node: &SearchNode,
        thread_idx: usize,
        rng: &mut Option<Xoshiro256PlusPlus>,
        f: Option<&(dyn Fn(&SearchNode, usize) + Sync)>,
    ) {
        if node.node_age.load(Ordering::Acquire) == self.search_node_age() {
            return;
        }

        let children = node.children();
        let num_children = SearchNode::count_children_in(children);
        if num_children > 0 {
            let order = shuffled_range(num_children, rng);
            for idx in order {
                let child = children[idx]
                    .get_if_allocated()
                    .expect("counted children must be allocated");
                self.any_order_helper(child, thread_idx, rng, f);
            }
        }

        // First thread to flip the age wins and performs the action.
        let old_age = node
            .node_age
            .swap(self.search_node_age(), Ordering::AcqRel);
        if old_age == self.search_node_age() {
            return;
        }
        if let Some(f) = f {
            f(node, thread_idx);
        }
    }

    /// Subtract this node's live contribution from its shared value-bias
    /// entry, scaled by the configured free proportion. Called exactly once
    /// right before the node is destroyed.
    pub(super) fn remove_subtree_value_bias(&self, node: &SearchNode) {
        if let Some(entry) = &node.subtree_value_bias_entry {
            let free_prop = self.params().subtree_value_bias_free_prop;
            let delta_to_subtract =
                node.last_subtree_value_bias_delta_sum.load(Ordering::Relaxed) * free_prop;
            let weight_to_subtract =
                node.last_subtree_value_bias_weight.load(Ordering::Relaxed) * free_prop;
            let mut sums = entry.sums.lock();
            sums.delta_utility_sum -= delta_to_subtract;
            sums.weight_sum -= weight_to_subtract;
        }
    }

    /// Delete every table node whose age marks it stale (`old` true: age
    /// below the current generation) or fresh (`old` false), subtracting
    /// value-bias contributions first.
    pub(super) fn delete_all_old_or_new_table_nodes_multithreaded(&mut self, old: bool) {
        let age = self.search_node_age();
        self.with_pool(|this, pool| {
            let num_threads_total = pool.num_workers() + 1;
            pool.perform_task_with_threads(&|thread_idx| {
                let num_shards = this.node_table().num_shards();
                let idx0 = thread_idx * num_shards / num_threads_total;
                let idx1 = (thread_idx + 1) * num_shards / num_threads_total;
                this.node_table().for_shard_range(idx0..idx1, |shard| {
                    shard.retain(|_, alloc| {
                        let node = alloc.get();
                        let is_old = node.node_age.load(Ordering::Acquire) < age;
                        if old == is_old {
                            this.remove_subtree_value_bias(node);
                            // All threads are quiesced; reclaim the node.
                            unsafe { drop(Box::from_raw(alloc.0)) };
                            false
                        } else {
                            true
                        }
                    });
                });
            });
        });
    }

    /// Delete every table node. Cheaper than the age-filtered sweep and
    /// skips value-bias subtraction (the whole table is going away).
    pub(super) fn delete_all_table_nodes_multithreaded(&mut self) {
        self.with_pool(|this, pool| {
            let num_threads_total = pool.num_workers() + 1;
            pool.perform_task_with_threads(&|thread_idx| {
                let num_shards = this.node_table().num_shards();
                let idx0 = thread_idx * num_shards / num_threads_total;
                let idx1 = (thread_idx + 1) * num_shards / num_threads_total;
                this.node_table().for_shard_range(idx0..idx1, |shard| {
                    for (_, alloc) in shard.drain() {
                        unsafe { drop(Box::from_raw(alloc.0)) };
                    }
                });
            });
        });
    }

    /// Recompute every node's stats bottom-up. Used when a stat-affecting
    /// parameter (dynamic score center, value bias, pattern bonus) changed
    /// between searches.
    pub(super) fn recursively_recompute_stats(&mut self, root_ptr: *mut SearchNode) {
        self.bump_search_node_age();
        let rngs = self.make_walk_rngs();
        let roots = NodePtrList(vec![root_ptr]);
        self.with_pool(|this, pool| {
            let threads: Vec<Mutex<Option<SearchThread>>> =
                (0..pool.num_workers() + 1).map(|_| Mutex::new(None)).collect();
            let f = |node: &SearchNode, thread_idx: usize| {
                let mut guard = threads[thread_idx].lock();
                let thread = guard.get_or_insert_with(|| SearchThread::new(thread_idx, this));

                let num_children = node.count_children();
                if num_children > 0 {
                    debug_assert!(node.nn_output_handle().is_some());
                }
                debug_assert_eq!(node.virtual_losses.load(Ordering::Acquire), 0);

                let is_root = this.node_is_root(node);
                if num_children == 0 {
                    let visits = node.stats.visits.load(Ordering::Acquire);
                    let weight_sum = node.stats.weight_sum.load(Ordering::Acquire);
                    // A 0-weight node can only be a root whose search was
                    // stopped before any playouts.
                    if weight_sum <= 0.0 {
                        debug_assert_eq!(visits, 0);
                        debug_assert!(is_root);
                        return;
                    }
                    let win_loss = node.stats.win_loss_value_avg.load(Ordering::Acquire);
                    let no_result = node.stats.no_result_value_avg.load(Ordering::Acquire);
                    let score_mean = node.stats.score_mean_avg.load(Ordering::Acquire);
                    let score_mean_sq = node.stats.score_mean_sq_avg.load(Ordering::Acquire);
                    let mut utility = this.get_result_utility(win_loss, no_result)
                        + this.get_score_utility(score_mean, score_mean_sq);
                    utility +=
                        this.get_pattern_bonus(node.pattern_bonus_hash, node.next_pla.opp());
                    node.stats_lock.lock();
                    node.stats.utility_avg.store(utility, Ordering::Release);
                    node.stats.utility_sq_avg.store(utility * utility, Ordering::Release);
                    node.stats_lock.unlock();
                } else {
                    this.recompute_node_stats(node, thread, 0, is_root);
                }
            };
            this.dispatch_walk(pool, &roots, &rngs, true, Some(&f));
        });
    }

    /// Enumerate every node reachable from the root, post-order, each
    /// exactly once. Mainly for tests and diagnostics.
    pub fn enumerate_tree_post_order(&mut self) -> Vec<*const SearchNode> {
        let root_ptr = match self.root_node_ptr() {
            Some(p) => p,
            None => return Vec::new(),
        };
        let collected: Mutex<ConstNodePtrVec> = Mutex::new(ConstNodePtrVec(Vec::new()));
        {
            let f = |node: &SearchNode, _thread_idx: usize| {
                collected.lock().0.push(node as *const SearchNode);
            };
            self.walk_tree_multithreaded(NodePtrList(vec![root_ptr]), true, Some(&f));
        }
        collected.into_inner().0
    }
}
