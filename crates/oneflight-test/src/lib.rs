//! Helpers for testing the resolver and its layers.
//!
//! When writing tests, keep the following points in mind:
//!
//!  - In every test, call [`setup`]. This will set up the logger so that all console output
//!    is captured by the test runner.
//!
//!  - Hooks run outside the test's call stack, so assertions on error delivery should go
//!    through an [`ErrorLog`] handed to the hook rather than through panics inside the hook
//!    itself. A panicking hook is contained by the resolver and never fails the test.

use std::fmt;
use std::sync::{Arc, Mutex};

use tracing_subscriber::filter::EnvFilter;
use tracing_subscriber::fmt::fmt;

/// Setup the test environment.
///
///  - Initializes logs: The logger only captures logs from the `oneflight` crate and mutes
///    all other logs.
pub fn setup() {
    fmt()
        .with_env_filter(EnvFilter::new("oneflight=trace"))
        .with_target(false)
        .pretty()
        .with_test_writer()
        .try_init()
        .ok();
}

/// Captures rendered errors delivered to an error hook.
///
/// Cloning shares the underlying log, so a clone can be moved into a hook
/// while the test keeps asserting on the original.
#[derive(Clone, Debug, Default)]
pub struct ErrorLog {
    errors: Arc<Mutex<Vec<String>>>,
}

impl ErrorLog {
    /// Creates an empty log.
    pub fn new() -> Self {
        Self::default()
    }

    /// Records `error`, rendered through its `Display` impl.
    pub fn record<E: fmt::Display>(&self, error: &E) {
        self.errors.lock().unwrap().push(error.to_string());
    }

    /// All errors recorded so far, in delivery order.
    pub fn errors(&self) -> Vec<String> {
        self.errors.lock().unwrap().clone()
    }

    /// Whether nothing has been recorded yet.
    pub fn is_empty(&self) -> bool {
        self.errors.lock().unwrap().is_empty()
    }
}
