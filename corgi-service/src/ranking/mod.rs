//! Ranking: candidate selection, scoring, cold-start, and the per-alias cache

pub mod cache;
pub mod coldstart;
pub mod engine;
pub mod scoring;

pub use cache::RankingService;
pub use coldstart::{ScoredPost, UserSignals};
pub use engine::{RankingEngine, RankingRequest};
