//! Game rules configuration.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ScoringRule {
    Area,
    Territory,
}

/// How handicap stones adjust white's score.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum HandicapBonusRule {
    None,
    N,
    NMinusOne,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Rules {
    pub scoring_rule: ScoringRule,
    pub komi: f32,
    pub multi_stone_suicide_legal: bool,
    pub white_handicap_bonus_rule: HandicapBonusRule,
}

impl Default for Rules {
    fn default() -> Rules {
        Rules {
            scoring_rule: ScoringRule::Area,
            komi: 7.5,
            multi_stone_suicide_legal: false,
            white_handicap_bonus_rule: HandicapBonusRule::None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_rules() {
        let rules = Rules::default();
        assert_eq!(rules.scoring_rule, ScoringRule::Area);
        assert_eq!(rules.komi, 7.5);
    }
}
