// Library exports for tollgate
// Cached, rate-limited, cost-accounted execution of metered remote calls

pub mod cache;
pub mod call;
pub mod config;
pub mod error;
pub mod ledger;
pub mod limiter;
pub mod llm;
pub mod retry;
