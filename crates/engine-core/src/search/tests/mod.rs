//! Whole-search scenario tests: quiescence invariants, expansion, graph
//! transposition, tree reuse, dispersion, and time-control behavior.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::board::{Board, BoardHistory, Rules};
use crate::eval::{NnEvaluator, NnInputParams, NnResultBuf, SlowEvaluator, UniformEvaluator};
use crate::types::{Loc, NnPos, Player};

use super::engine::{Search, SearchError};
use super::node::{self, SearchNode};
use super::params::SearchParams;
use super::thread_ctx::SearchThread;
use super::time_manager::{AbsoluteTimeControls, UnlimitedTimeControls};

const BOARD_SIZE: usize = 5;

fn make_search(params: SearchParams) -> Search {
    make_search_with_eval(params, Arc::new(UniformEvaluator::new(BOARD_SIZE, BOARD_SIZE)))
}

fn make_search_with_eval(params: SearchParams, eval: Arc<dyn NnEvaluator>) -> Search {
    Search::new(
        params,
        eval,
        "test-seed",
        Board::new(BOARD_SIZE, BOARD_SIZE),
        Player::Black,
        Rules::default(),
    )
    .unwrap()
}

fn run_search(search: &mut Search) {
    let stop = AtomicBool::new(false);
    search
        .run_whole_search(&stop, None, false, &UnlimitedTimeControls, 1.0)
        .unwrap();
}

/// An evaluator whose policy puts most mass on one move, for tests that
/// need a dominant child.
struct BiasedEvaluator {
    inner: UniformEvaluator,
    favorite: Loc,
    favorite_mass: f32,
}

impl NnEvaluator for BiasedEvaluator {
    fn nn_x_len(&self) -> usize {
        self.inner.nn_x_len()
    }
    fn nn_y_len(&self) -> usize {
        self.inner.nn_y_len()
    }

    fn evaluate(
        &self,
        board: &Board,
        history: &BoardHistory,
        next_pla: Player,
        params: &NnInputParams,
        buf: &mut NnResultBuf,
        skip_cache: bool,
        include_owner_map: bool,
    ) {
        self.inner
            .evaluate(board, history, next_pla, params, buf, skip_cache, include_owner_map);
        let out = buf.result.take().unwrap();
        let mut out = (*out).clone();
        let pos = NnPos::loc_to_pos(self.favorite, board.x_size, self.nn_x_len(), self.nn_y_len());
        if out.policy_probs[pos] >= 0.0 {
            let remaining = 1.0 - self.favorite_mass;
            let legal_sum: f32 = out.policy_probs.iter().filter(|p| **p >= 0.0).sum();
            for p in out.policy_probs.iter_mut() {
                if *p >= 0.0 {
                    *p = *p / legal_sum * remaining;
                }
            }
            out.policy_probs[pos] += self.favorite_mass;
        }
        buf.result = Some(Arc::new(out));
    }
}

fn for_each_tree_node(search: &mut Search, mut f: impl FnMut(&SearchNode)) {
    for ptr in search.enumerate_tree_post_order() {
        f(unsafe { &*ptr });
    }
}

// ---- scenario: terminal leaf ----

#[test]
fn test_terminal_leaf_value() {
    let mut search = make_search(SearchParams::for_testing(10));
    // Two passes end the game; the empty board scores komi for white.
    assert!(search.make_move(Loc::PASS, Player::Black));
    assert!(search.make_move(Loc::PASS, Player::White));
    assert!(search.root_history().is_game_finished);
    assert_eq!(search.root_history().winner, Some(Player::White));

    // A node that is not protected by force-non-terminal takes the terminal
    // value in a single playout.
    let mut thread = SearchThread::new(0, &search);
    let terminal_node = SearchNode::new(search.root_pla(), false, 0);
    let finished = search.playout_descend(&mut thread, &terminal_node, false);
    assert!(finished);

    let stats = terminal_node.stats.snapshot();
    assert_eq!(stats.visits, 1);
    assert_eq!(stats.win_loss_value_avg, 1.0);
    assert_eq!(stats.score_mean_avg, 7.5);
    assert_eq!(stats.no_result_value_avg, 0.0);
}

// ---- scenario: expansion ladder ----

#[test]
fn test_expansion_ladder_growth() {
    let mut search = make_search(SearchParams::for_testing(300));
    run_search(&mut search);

    let root = search.root_node_ref().unwrap();
    let num_children = root.count_children();
    assert!(
        num_children > node::CHILDREN0_SIZE,
        "expected more than {} root children, got {num_children}",
        node::CHILDREN0_SIZE
    );
    assert!(root.state() >= node::STATE_EXPANDED1);

    // All children reachable, prefix-packed, with distinct legal moves.
    let children = root.children();
    let mut seen_moves = std::collections::HashSet::new();
    for slot in children.iter().take(num_children) {
        assert!(slot.get_if_allocated().is_some());
        let loc = slot.move_loc();
        assert!(
            search
                .root_history()
                .is_legal(search.root_board(), loc, search.root_pla()),
            "child move must be legal"
        );
        assert!(seen_moves.insert(loc), "duplicate child move {loc:?}");
    }
    for slot in children.iter().skip(num_children) {
        assert!(slot.get_if_allocated().is_none());
    }

    // Readers holding the older state still see the original prefix.
    let old = root.children_for_state(node::STATE_EXPANDED0);
    assert_eq!(old.len(), node::CHILDREN0_SIZE);
    for slot in old {
        assert!(slot.get_if_allocated().is_some());
    }
}

// ---- post-search quiescence invariants ----

#[test]
fn test_quiescence_invariants_single_thread() {
    let mut search = make_search(SearchParams::for_testing(200));
    run_search(&mut search);
    check_quiescence(&mut search);
}

#[test]
fn test_quiescence_invariants_multi_thread() {
    let mut params = SearchParams::for_testing(400);
    params.num_threads = 4;
    let mut search = make_search(params);
    run_search(&mut search);
    check_quiescence(&mut search);
}

fn check_quiescence(search: &mut Search) {
    let mut num_nodes = 0;
    for_each_tree_node(search, |n| {
        num_nodes += 1;
        assert_eq!(n.virtual_losses.load(Ordering::Acquire), 0);
        assert_eq!(n.dirty_counter.load(Ordering::Acquire), 0);

        let node_visits = n.stats.visits.load(Ordering::Acquire);
        assert!(node_visits >= 0);

        // Prefix-packedness and edge-visit bounds.
        let children = n.children();
        let num_children = SearchNode::count_children_in(children);
        for slot in children.iter().take(num_children) {
            let child = slot.get_if_allocated().unwrap();
            let edge_visits = slot.edge_visits();
            let child_visits = child.stats.visits.load(Ordering::Acquire);
            assert!(
                edge_visits <= child_visits,
                "edge visits {edge_visits} exceed child visits {child_visits}"
            );
        }
        for slot in children.iter().skip(num_children) {
            assert!(slot.get_if_allocated().is_none());
        }
    });
    assert!(num_nodes > 0);
}

#[test]
fn test_weight_sum_conservation() {
    let mut search = make_search(SearchParams::for_testing(150));
    run_search(&mut search);

    let root = search.root_node_ref().unwrap();
    let nn = root.nn_output().unwrap();
    let self_weight = search.compute_weight_from_nn_output(&nn);
    let mut child_edge_weight = 0.0;
    for slot in root.children() {
        let child = match slot.get_if_allocated() {
            Some(c) => c,
            None => break,
        };
        let stats = child.stats.snapshot();
        if stats.visits > 0 {
            child_edge_weight += stats.weight_sum * (slot.edge_visits() as f64 / stats.visits as f64);
        }
    }
    let weight_sum = root.stats.weight_sum.load(Ordering::Acquire);
    assert!(
        (weight_sum - (child_edge_weight + self_weight)).abs() < 1e-6,
        "weight sum {weight_sum} != children {child_edge_weight} + self {self_weight}"
    );
}

// ---- reported values contract ----

#[test]
fn test_reported_values_contract() {
    let mut search = make_search(SearchParams::for_testing(120));
    run_search(&mut search);
    let values = search.get_root_values().unwrap();
    assert!(values.win_loss_value.abs() <= 1.0);
    assert!(values.no_result_value >= 0.0);
    assert!(values.no_result_value <= 1.0 - values.win_loss_value.abs());
    let total = values.win_value + values.loss_value + values.no_result_value;
    assert!((total - 1.0).abs() < 1e-10, "win/loss/noresult sum to {total}");
    assert!(values.visits > 0);
    assert!(values.weight > 0.0);
}

// ---- determinism and idempotence ----

#[test]
fn test_single_thread_determinism() {
    let visits_a = root_child_visits(run_fresh_search());
    let visits_b = root_child_visits(run_fresh_search());
    assert_eq!(visits_a, visits_b);
}

fn run_fresh_search() -> Search {
    let mut search = make_search(SearchParams::for_testing(100));
    run_search(&mut search);
    search
}

fn root_child_visits(search: Search) -> Vec<(Loc, i64)> {
    let root = search.root_node_ref().unwrap();
    let mut out = Vec::new();
    for slot in root.children() {
        match slot.get_if_allocated() {
            Some(child) => out.push((
                slot.move_loc(),
                child.stats.visits.load(Ordering::Acquire),
            )),
            None => break,
        }
    }
    out
}

#[test]
fn test_begin_search_idempotent() {
    let mut search = make_search(SearchParams::for_testing(100));
    run_search(&mut search);

    search.begin_search(false).unwrap();
    let first = search.root_node_ref().unwrap().stats.snapshot();
    search.begin_search(false).unwrap();
    let second = search.root_node_ref().unwrap().stats.snapshot();

    assert_eq!(first.visits, second.visits);
    assert!((first.weight_sum - second.weight_sum).abs() < 1e-9);
    assert!((first.utility_avg - second.utility_avg).abs() < 1e-9);
    assert!((first.win_loss_value_avg - second.win_loss_value_avg).abs() < 1e-9);
}

// ---- enumeration ----

#[test]
fn test_enumerate_tree_post_order_visits_each_node_once() {
    let mut search = make_search(SearchParams::for_testing(150));
    run_search(&mut search);
    let nodes = search.enumerate_tree_post_order();
    let distinct: std::collections::HashSet<_> = nodes.iter().copied().collect();
    assert_eq!(nodes.len(), distinct.len());
    // Every non-root node is table-owned; the root is not.
    assert_eq!(search.node_table().num_nodes() + 1, nodes.len());
}

// ---- virtual-loss dispersion ----

#[test]
fn test_virtual_loss_dispersion() {
    let mut params = SearchParams::for_testing(100);
    params.num_threads = 4;
    let eval = SlowEvaluator::new(
        UniformEvaluator::new(BOARD_SIZE, BOARD_SIZE),
        Duration::from_millis(10),
    );
    let mut search = make_search_with_eval(params, Arc::new(eval));
    run_search(&mut search);

    let root = search.root_node_ref().unwrap();
    let root_visits = root.stats.visits.load(Ordering::Acquire);
    assert!(root_visits >= 50, "search should have made progress");
    let num_children = root.count_children();
    assert!(num_children >= 4);
    for slot in root.children().iter().take(num_children) {
        let child = slot.get_if_allocated().unwrap();
        let child_visits = child.stats.visits.load(Ordering::Acquire);
        assert!(
            (child_visits as f64) < 0.95 * root_visits as f64,
            "one child absorbed {child_visits} of {root_visits} visits"
        );
    }
    check_quiescence(&mut search);
}

// ---- graph search transposition ----

#[test]
fn test_graph_search_transposition_shares_nodes() {
    let mut params = SearchParams::for_testing(400);
    params.use_graph_search = true;
    let mut search = make_search(params);
    run_search(&mut search);

    // Find two root children a, b and check that a->b and b->a lead to the
    // same node with consistent edge accounting.
    let root = search.root_node_ref().unwrap();
    let mut transpositions_found = 0;
    let children = root.children();
    let n = root.count_children();
    for i in 0..n {
        for j in 0..n {
            if i == j {
                continue;
            }
            let (a_slot, b_slot) = (&children[i], &children[j]);
            let (a_loc, b_loc) = (a_slot.move_loc(), b_slot.move_loc());
            if a_loc == Loc::PASS || b_loc == Loc::PASS {
                continue;
            }
            let a = a_slot.get_if_allocated().unwrap();
            let b = b_slot.get_if_allocated().unwrap();
            let a_then_b = find_child(a, b_loc);
            let b_then_a = find_child(b, a_loc);
            if let (Some((ab_node, ab_edge)), Some((ba_node, ba_edge))) = (a_then_b, b_then_a) {
                assert!(
                    std::ptr::eq(ab_node, ba_node),
                    "transposing paths must share one node"
                );
                let shared_visits = ab_node.stats.visits.load(Ordering::Acquire);
                assert!(ab_edge <= shared_visits);
                assert!(ba_edge <= shared_visits);
                transpositions_found += 1;
            }
        }
    }
    assert!(
        transpositions_found > 0,
        "expected at least one transposition in a graph search"
    );
}

fn find_child<'a>(node: &'a SearchNode, loc: Loc) -> Option<(&'a SearchNode, i64)> {
    for slot in node.children() {
        let child = slot.get_if_allocated()?;
        if slot.move_loc() == loc {
            return Some((child, slot.edge_visits()));
        }
    }
    None
}

// ---- tree reuse ----

#[test]
fn test_tree_reuse_on_make_move() {
    let mut search = make_search(SearchParams::for_testing(1000));
    run_search(&mut search);

    let root = search.root_node_ref().unwrap();
    let (best_loc, old_child_visits) = {
        let mut best = (Loc::NULL, -1i64);
        for slot in root.children() {
            match slot.get_if_allocated() {
                Some(child) => {
                    let v = child.stats.visits.load(Ordering::Acquire);
                    if v > best.1 {
                        best = (slot.move_loc(), v);
                    }
                }
                None => break,
            }
        }
        best
    };
    assert!(best_loc != Loc::NULL && old_child_visits > 0);

    assert!(search.make_move(best_loc, Player::Black));

    let new_root_visits = search.get_root_visits();
    assert!(new_root_visits >= 1);
    assert!(new_root_visits <= old_child_visits + 1);

    // The table holds exactly the nodes still reachable from the new root.
    let reachable = search.enumerate_tree_post_order().len();
    assert_eq!(search.node_table().num_nodes() + 1, reachable);
}

#[test]
fn test_make_move_without_tree_clears() {
    let mut search = make_search(SearchParams::for_testing(10));
    assert!(search.make_move(Loc::from_xy(2, 2, BOARD_SIZE), Player::Black));
    assert_eq!(search.get_root_visits(), 0);
    assert_eq!(search.root_pla(), Player::White);
}

// ---- time control ----

#[test]
fn test_futile_visits_time_shrink() {
    let mut params = SearchParams::for_testing(2000);
    params.futile_visits_threshold = 0.8;
    // Greedy move selection: the futility bar is the full threshold.
    params.chosen_move_temperature_early = 0.0;
    let eval = BiasedEvaluator {
        inner: UniformEvaluator::new(BOARD_SIZE, BOARD_SIZE),
        favorite: Loc::from_xy(2, 2, BOARD_SIZE),
        favorite_mass: 0.9,
    };
    let mut search = make_search_with_eval(params, Arc::new(eval));
    run_search(&mut search);

    let root_visits = search.get_root_visits();
    assert!(root_visits >= 1000);

    let tc = AbsoluteTimeControls {
        per_move_seconds: 5.0,
    };
    // Deep into the budget with a dominant move: the recommendation shrinks
    // to roughly the time already used.
    let time_used = 4.0;
    let limit = search.recompute_search_time_limit(&tc, time_used, 1.0, root_visits);
    assert!(
        limit <= time_used,
        "expected shrink to ~{time_used}, got {limit}"
    );
    assert!(limit > time_used * 0.9);
}

#[test]
fn test_unlimited_time_no_shrink() {
    let mut search = make_search(SearchParams::for_testing(50));
    run_search(&mut search);
    let bound = search.compute_upper_bound_visits_left_due_to_time(1, 0.0, 1e30);
    assert!(bound >= 1e30, "no bound expected for tiny searches");
}

// ---- stop flag ----

#[test]
fn test_stop_flag_halts_search() {
    let mut params = SearchParams::default();
    params.max_visits = i64::MAX / 4;
    let mut search = make_search(params);
    let stop = AtomicBool::new(true);
    search
        .run_whole_search(&stop, None, false, &UnlimitedTimeControls, 1.0)
        .unwrap();
    // The pre-set stop flag halts before any playout completes.
    assert!(search.last_search_num_playouts() <= 1);
}

// ---- error handling ----

#[test]
fn test_board_too_large_is_config_error() {
    let eval = Arc::new(UniformEvaluator::new(5, 5));
    let result = Search::new(
        SearchParams::default(),
        eval,
        "seed",
        Board::new(9, 9),
        Player::Black,
        Rules::default(),
    );
    match result {
        Err(SearchError::BoardTooLarge { .. }) => {}
        other => panic!("expected BoardTooLarge, got {other:?}"),
    }
}

// ---- search begun callback ----

#[test]
fn test_search_begun_callback_fires_once() {
    let mut search = make_search(SearchParams::for_testing(20));
    let stop = AtomicBool::new(false);
    let calls = std::sync::atomic::AtomicUsize::new(0);
    let cb = || {
        calls.fetch_add(1, Ordering::Relaxed);
    };
    search
        .run_whole_search(&stop, Some(&cb), false, &UnlimitedTimeControls, 1.0)
        .unwrap();
    assert_eq!(calls.load(Ordering::Relaxed), 1);
}
