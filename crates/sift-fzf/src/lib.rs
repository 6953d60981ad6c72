//! Fuzzy path search: a character-DP scorer applied incrementally along
//! directory paths, a bounded top-K heap, and the HTTP service that evaluates
//! queries over a distribution's consolidated path index.

pub mod heap;
pub mod matcher;
pub mod node;
pub mod server;

pub use heap::{ScoredPath, TopK};
pub use matcher::Matcher;
pub use node::Node;
