//! SQL sanitization, complexity scoring and per-caller admission control.

pub mod complexity;
pub mod concurrency;
pub mod rate_limiter;
pub mod sanitizer;

pub use complexity::ComplexityAnalyzer;
pub use concurrency::{ConcurrencyLimiter, ConcurrencyPermit};
pub use rate_limiter::{RateLimitDecision, RateLimitStatus, RateLimiter, RateLimiterBuilder};
pub use sanitizer::{ComparisonOp, Condition, SortDirection, SqlSanitizer};
