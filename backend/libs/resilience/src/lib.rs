//! Resilience helpers for long-running consumers
//!
//! - **Retry**: bounded attempts with exponential backoff (`base × 2^attempt`, capped)
//! - **Timeout**: a hard limit on a single attempt
//!
//! # Example: reconnect with backoff
//!
//! ```rust,no_run
//! use resilience::{with_retry, with_timeout, RetryConfig};
//! use std::time::Duration;
//!
//! #[tokio::main]
//! async fn main() {
//!     let config = RetryConfig {
//!         max_attempts: 5,
//!         base_delay: Duration::from_secs(2),
//!         ..Default::default()
//!     };
//!
//!     let result = with_retry(&config, "target store", || {
//!         with_timeout(Duration::from_secs(10), async {
//!             // open the connection here
//!             Ok::<_, String>(())
//!         })
//!     })
//!     .await;
//! }
//! ```

pub mod retry;
pub mod timeout;

pub use retry::{with_retry, RetryConfig, RetryError};
pub use timeout::{with_timeout, TimeoutError};
