pub mod expr;
pub mod solver;
pub mod translate;
pub mod wish;

pub use solver::{solve, SolveOutcome};
pub use translate::{flip_branch_query, Query, SmtError};
pub use wish::WishSolver;
