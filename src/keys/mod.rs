pub mod rate_limit;
pub mod store;

pub use rate_limit::{Admission, RateLimiter};
pub use store::{ApiKey, ApiKeyStore, KeyUpdate};
