//! Request middleware: identity resolution, rate limiting, timing

pub mod identity;
pub mod rate_limit;
pub mod timing;

pub use identity::resolve_identity;
pub use rate_limit::{enforce_rate_limit, RateLimiter};
pub use timing::processing_time;
