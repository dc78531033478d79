pub mod cache;
pub mod eval;

pub use cache::{CompiledRule, RuleCache};
