//! A keyed memoization layer with stale-while-revalidate caching and
//! request coalescing.
//!
//! Three layers cooperate here:
//!
//! - A freshness store keeps the last successfully computed value per key,
//!   however old, until a coarse garbage-retention window elapses.
//! - A flight registry tracks the single computation currently running per
//!   key, so concurrent calls coalesce onto one computation instead of
//!   racing their own.
//! - The [`Resolver`] decides, per call, whether to serve the stored value,
//!   refresh it in the background or synchronously, and whether a failure
//!   propagates or is swallowed in favor of the stored fallback.
//!
//! ```
//! use oneflight::{Resolver, ResolveOptions, ResolverConfig};
//!
//! # async fn example() -> Result<(), oneflight::ResolveError> {
//! let resolver: Resolver<String> = Resolver::new(ResolverConfig::default());
//!
//! let value = resolver
//!     .resolve(
//!         ResolveOptions::new("greeting").lifetime(std::time::Duration::from_secs(60)),
//!         || async { Ok(String::from("hello")) },
//!     )
//!     .await?;
//! assert_eq!(value, "hello");
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]

mod config;
mod defer;
mod error;
mod flight;
mod resolver;
mod store;

pub use config::ResolverConfig;
pub use error::{ForcedFailure, ResolveError};
pub use resolver::{ErrorHook, ForceRefresh, ResolveOptions, Resolver};

#[cfg(any(test, feature = "test"))]
pub(crate) use tokio::time;

#[cfg(not(any(test, feature = "test")))]
pub(crate) use std::time;
