mod client;
mod odata;
mod paginate;
mod rate_limit;

pub use client::{ApiClient, ApiClientConfig};
pub use odata::{ODataQuery, Page, ParseMode};
pub use rate_limit::RateLimiter;
