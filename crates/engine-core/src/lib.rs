pub mod board;
pub mod eval;
pub mod search;
pub mod types;

pub use board::{Board, BoardHistory, Rules};
pub use eval::{NnEvaluator, NnInputParams, NnOutput, NnResultBuf};
pub use search::{ReportedSearchValues, Search, SearchError, SearchParams};
pub use types::{Color, Hash128, Loc, Player};
