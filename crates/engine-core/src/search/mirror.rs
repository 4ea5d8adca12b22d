//! Anti-mirror heuristics.
//!
//! When the opponent is detected to be mirroring our moves through the
//! board center, plain search plays into a losing parity game. These
//! adjustments put prior mass on the opponent continuing to mirror, and
//! force exploration of center-region moves that refute the strategy.

use crate::board::BoardHistory;
use crate::types::{Loc, Player};

use super::engine::Search;
use super::thread_ctx::SearchThread;

impl Search {
    /// Whether every opponent reply since the search root mirrored the
    /// preceding move, tolerating the most recent `skip_recent` plies.
    pub fn is_mirroring_since_search_start(
        &self,
        thread_history: &BoardHistory,
        skip_recent: usize,
    ) -> bool {
        let x_size = self.root_board().x_size;
        let y_size = self.root_board().y_size;
        let root_len = self.root_history().move_history.len();
        let moves = &thread_history.move_history;
        let mut i = root_len + 1;
        while i + skip_recent < moves.len() {
            if moves[i].loc != moves[i - 1].loc.mirror(x_size, y_size) {
                return false;
            }
            i += 2;
        }
        true
    }

    /// Boost the prior on the opponent continuing to mirror, and on our own
    /// center-refuting candidate moves.
    pub fn maybe_apply_anti_mirror_policy(
        &self,
        nn_policy_prob: &mut f32,
        move_loc: Loc,
        policy_probs: &[f32],
        move_pla: Player,
        thread: &SearchThread,
    ) {
        let x_size = thread.board.x_size;
        let y_size = thread.board.y_size;
        let mut weight: f64 = 0.0;

        if move_pla == self.root_pla().opp() && !thread.history.move_history.is_empty() {
            let prev_loc = thread.history.move_history.last().unwrap().loc;
            if prev_loc == Loc::PASS {
                return;
            }
            let mut mirror_loc = prev_loc.mirror(x_size, y_size);
            if policy_probs[self.get_pos(mirror_loc)] < 0.0 {
                mirror_loc = Loc::PASS;
            }
            if move_loc == mirror_loc {
                weight = 1.0;
                let center_loc = Loc::center(x_size, y_size);
                let is_difficult = center_loc != Loc::NULL
                    && thread.board.color(center_loc).player() == self.mirroring_pla()
                    && self.mirror_advantage() >= -0.5;
                if is_difficult {
                    weight *= 3.0;
                }
            }
        } else if move_pla == self.root_pla() && move_loc != Loc::PASS {
            if move_loc.is_central(x_size, y_size) {
                weight = 0.3;
            } else {
                if move_loc.is_near_central(x_size, y_size) {
                    weight = 0.05;
                }
                let center_loc = Loc::center(x_size, y_size);
                if center_loc != Loc::NULL
                    && self.root_board().color(center_loc).player() == Some(move_pla.opp())
                {
                    if thread.board.is_adjacent_to_chain(move_loc, center_loc) {
                        weight = 0.05;
                    } else {
                        let distance_sq =
                            move_loc.euclidean_distance_squared(center_loc, x_size);
                        if distance_sq <= 2 {
                            weight = 0.05;
                        } else if distance_sq <= 4 {
                            weight = 0.03;
                        }
                    }
                }
            }
        }

        if weight > 0.0 {
            let depth =
                thread.history.move_history.len() - self.root_history().move_history.len();
            let weight = weight / (1.0 + (depth as f64).sqrt());
            *nn_policy_prob += (1.0 - *nn_policy_prob) * weight as f32;
        }
    }

    /// Force playouts down mirror continuations (so their true value is
    /// learned) and down our center-refuting moves (so refutations get
    /// searched even when their static values look slightly worse).
    #[allow(clippy::too_many_arguments)]
    pub fn maybe_apply_anti_mirror_forced_explore(
        &self,
        child_utility: &mut f64,
        parent_utility: f64,
        move_loc: Loc,
        policy_probs: &[f32],
        this_child_weight: f64,
        total_child_weight: f64,
        move_pla: Player,
        parent_is_root: bool,
        thread: &SearchThread,
    ) {
        let mirroring_pla = match self.mirroring_pla() {
            Some(p) => p,
            None => return,
        };
        debug_assert_eq!(mirroring_pla, self.root_pla().opp());
        let parent_pla = move_pla;
        let parent_sign = parent_pla.white_sign();

        let x_size = thread.board.x_size;
        let y_size = thread.board.y_size;
        let center_loc = Loc::center(x_size, y_size);
        // The hardest case: the opponent holds the center and komi favors
        // them too.
        let is_difficult = center_loc != Loc::NULL
            && thread.board.color(center_loc).player() == Some(mirroring_pla)
            && self.mirror_advantage() >= -0.5;

        if move_pla == mirroring_pla && !thread.history.move_history.is_empty() {
            let prev_loc = thread.history.move_history.last().unwrap().loc;
            if prev_loc == Loc::PASS {
                return;
            }
            let mut mirror_loc = prev_loc.mirror(x_size, y_size);
            if policy_probs[self.get_pos(mirror_loc)] < 0.0 {
                mirror_loc = Loc::PASS;
            }
            if move_loc != mirror_loc {
                return;
            }
            let mut proportion_to_dump: f64;
            let mut proportion_to_bias: f64;
            if is_difficult {
                proportion_to_dump = 0.20;
                if mirror_loc != Loc::PASS && center_loc != Loc::NULL {
                    let dist_sq =
                        center_loc.euclidean_distance_squared(mirror_loc, x_size) as f64;
                    proportion_to_dump = proportion_to_dump.max(
                        1.0 / (0.75 + 0.5 * dist_sq.sqrt())
                            / self.mirror_center_symmetry_error().max(1.0),
                    );
                }
                proportion_to_bias = 0.75;
            } else if self.mirror_advantage() >= 5.0 {
                proportion_to_dump = 0.15;
                proportion_to_bias = 0.50;
            } else if self.mirror_advantage() >= -5.0 {
                proportion_to_dump = 0.10 + self.mirror_advantage();
                proportion_to_bias = 0.30 + self.mirror_advantage() * 4.0;
            } else {
                proportion_to_dump = 0.05;
                proportion_to_bias = 0.10;
            }

            if mirror_loc == Loc::PASS {
                proportion_to_dump *= if move_loc == center_loc {
                    0.35
                } else {
                    0.35 / self.mirror_center_symmetry_error().sqrt().max(1.0)
                };
            }
            if self.mirror_center_symmetry_error() >= 1.0 {
                proportion_to_dump /= self.mirror_center_symmetry_error();
                proportion_to_bias /= self.mirror_center_symmetry_error();
            }

            let damp = (1.0 - 0.7 * parent_utility * parent_utility).max(0.3);
            if this_child_weight < proportion_to_dump * total_child_weight {
                *child_utility += parent_sign * 100.0;
            }
            if this_child_weight < proportion_to_bias * total_child_weight {
                *child_utility += parent_sign * 0.18 * damp;
            }
            if this_child_weight < 0.5 * proportion_to_bias * total_child_weight {
                *child_utility += parent_sign * 0.36 * damp;
            }
        } else if move_pla == self.root_pla() && move_loc != Loc::PASS {
            let mut proportion_to_dump = 0.0;
            if is_difficult && center_loc != Loc::NULL {
                if thread.board.is_adjacent_to_chain(move_loc, center_loc) {
                    let libs = thread.board.num_liberties(center_loc) as f64;
                    let damp = (1.0 - 0.7 * parent_utility * parent_utility).max(0.3);
                    *child_utility += parent_sign * 0.75 / (1.0 + libs)
                        / self.mirror_center_symmetry_error().max(1.0)
                        * damp;
                    proportion_to_dump = 0.10 / libs.max(1.0);
                }
                let distance_sq = move_loc.euclidean_distance_squared(center_loc, x_size);
                if distance_sq <= 2 {
                    proportion_to_dump = proportion_to_dump.max(0.010);
                } else if distance_sq <= 4 {
                    proportion_to_dump = proportion_to_dump.max(0.005);
                }
            }
            if move_loc == center_loc {
                proportion_to_dump = if parent_is_root { 0.06 } else { 0.12 };
            }

            let utility_loss = parent_sign * (parent_utility - *child_utility);
            if utility_loss > 0.0 && utility_loss * proportion_to_dump > 0.03 {
                proportion_to_dump += 0.5 * (0.03 / utility_loss - proportion_to_dump);
            }

            if let Some(prev) = thread.history.move_history.last() {
                if prev.loc != Loc::NULL && prev.loc != Loc::PASS && center_loc != Loc::NULL {
                    let center_distance_sq =
                        center_loc.euclidean_distance_squared(prev.loc, x_size);
                    if center_distance_sq <= 16 {
                        proportion_to_dump *= 0.900;
                    }
                    if center_distance_sq <= 5 {
                        proportion_to_dump *= 0.825;
                    }
                    if center_distance_sq <= 2 {
                        proportion_to_dump *= 0.750;
                    }
                }
            }

            if this_child_weight < proportion_to_dump * total_child_weight {
                *child_utility += parent_sign * 100.0;
            }
        }
    }
}
