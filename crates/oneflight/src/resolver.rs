use std::fmt;
use std::future::Future;
use std::panic;
use std::sync::Arc;
use std::sync::atomic::{AtomicIsize, Ordering};
use std::time::Duration;

use crate::config::ResolverConfig;
use crate::defer::OnDrop;
use crate::error::ResolveError;
use crate::flight::{self, FlightChannel, FlightRegistry};
use crate::store::FreshnessStore;

/// Whether a call insists on recomputing its value.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum ForceRefresh {
    /// Serve the stored value if one exists, refreshing only when it has
    /// outlived the call's lifetime.
    #[default]
    No,
    /// Serve the stored value if one exists, but always recompute in the
    /// background.
    Background,
    /// Never serve the stored value; block until the recomputation settles.
    Blocking,
}

/// Per-call parameters for [`Resolver::resolve`].
#[derive(Clone, Debug)]
pub struct ResolveOptions {
    key: String,
    lifetime: Option<Duration>,
    refresh: ForceRefresh,
}

impl ResolveOptions {
    /// Options for `key` with infinite freshness and no forced refresh.
    pub fn new(key: impl Into<String>) -> Self {
        ResolveOptions {
            key: key.into(),
            lifetime: None,
            refresh: ForceRefresh::No,
        }
    }

    /// How long a stored value counts as fresh.
    ///
    /// A value older than this is still served, but triggers a refresh in
    /// the background. Without a lifetime, stored values never go stale.
    pub fn lifetime(mut self, lifetime: Duration) -> Self {
        self.lifetime = Some(lifetime);
        self
    }

    /// Forces a refresh regardless of the stored value's age.
    pub fn refresh(mut self, refresh: ForceRefresh) -> Self {
        self.refresh = refresh;
        self
    }
}

/// An observational callback receiving every computation error, whether or
/// not the failure is ultimately swallowed.
///
/// Hooks never alter how a call settles; a panicking hook is caught and
/// logged.
pub type ErrorHook = Arc<dyn Fn(&ResolveError) + Send + Sync>;

/// A keyed memoization layer with stale-while-revalidate semantics.
///
/// Results are served from the [`FreshnessStore`] whenever a value is
/// available, however old. Values past their per-call lifetime are refreshed
/// in the background while the stale value keeps being served. Concurrent
/// calls for the same key never compute twice; they coalesce onto the single
/// computation registered in the [`FlightRegistry`].
pub struct Resolver<T> {
    store: FreshnessStore<T>,
    flights: FlightRegistry<T>,
    /// Remaining budget for stale-triggered background refreshes.
    stale_refreshes: Arc<AtomicIsize>,
}

impl<T> Clone for Resolver<T> {
    fn clone(&self) -> Self {
        Resolver {
            store: self.store.clone(),
            flights: self.flights.clone(),
            stale_refreshes: Arc::clone(&self.stale_refreshes),
        }
    }
}

impl<T> fmt::Debug for Resolver<T>
where
    T: Clone + Send + Sync + 'static,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Resolver")
            .field("stored entries", &self.store.entry_count())
            .field("in-flight computations", &self.flights.len())
            .finish()
    }
}

impl<T> Resolver<T>
where
    T: Clone + Send + Sync + 'static,
{
    /// Creates a resolver with the given configuration.
    pub fn new(config: ResolverConfig) -> Self {
        Resolver {
            store: FreshnessStore::new(config.capacity, config.retain_for),
            flights: FlightRegistry::new(),
            stale_refreshes: Arc::new(AtomicIsize::new(config.max_stale_refreshes)),
        }
    }

    /// Whether some value, however old, is stored for `key`.
    pub fn contains(&self, key: &str) -> bool {
        self.store.contains(key)
    }

    /// Resolves the value for a key, computing it if necessary.
    ///
    /// The actual computation is deduplicated between concurrent calls for
    /// the same key: `compute` runs at most once per in-flight window, and
    /// every caller observes the settled outcome of the one hosted
    /// computation.
    pub async fn resolve<C, F>(&self, options: ResolveOptions, compute: C) -> Result<T, ResolveError>
    where
        C: FnOnce() -> F + Send + 'static,
        F: Future<Output = Result<T, ResolveError>> + Send + 'static,
    {
        self.resolve_inner(options, compute, None).await
    }

    /// Like [`resolve`](Self::resolve), with an error hook.
    ///
    /// The hook fires for every failure of the hosted computation, before
    /// the outcome settles, including failures that are swallowed in favor
    /// of a stored fallback value.
    pub async fn resolve_with_hook<C, F>(
        &self,
        options: ResolveOptions,
        compute: C,
        hook: ErrorHook,
    ) -> Result<T, ResolveError>
    where
        C: FnOnce() -> F + Send + 'static,
        F: Future<Output = Result<T, ResolveError>> + Send + 'static,
    {
        self.resolve_inner(options, compute, Some(hook)).await
    }

    async fn resolve_inner<C, F>(
        &self,
        options: ResolveOptions,
        compute: C,
        hook: Option<ErrorHook>,
    ) -> Result<T, ResolveError>
    where
        C: FnOnce() -> F + Send + 'static,
        F: Future<Output = Result<T, ResolveError>> + Send + 'static,
    {
        let ResolveOptions {
            key,
            lifetime,
            refresh,
        } = options;

        // A blocking refresh never serves from the store, everything else
        // does.
        let served = match refresh {
            ForceRefresh::Blocking => None,
            _ => self.store.get(&key),
        };

        match refresh {
            ForceRefresh::No => match served {
                Some(entry) => {
                    let is_stale =
                        lifetime.is_some_and(|lifetime| entry.stored_at.elapsed() >= lifetime);
                    if is_stale {
                        tracing::trace!(key = %key, "serving stale value");
                        self.spawn_stale_refresh(&key, compute, hook, entry.value.clone());
                    } else {
                        tracing::trace!(key = %key, "serving cached value");
                    }
                    Ok(entry.value)
                }
                None => {
                    let mut compute = Some(compute);
                    let channel = match self.flights.try_host(&key, || {
                        let computation = compute.take().expect("hosted at most once");
                        Self::hosted(
                            self.store.clone(),
                            key.clone(),
                            ForceRefresh::No,
                            None,
                            computation(),
                            hook,
                        )
                    }) {
                        Ok(channel) => {
                            tracing::trace!(key = %key, "hosting computation");
                            channel
                        }
                        Err(channel) => {
                            tracing::trace!(key = %key, "joining in-flight computation");
                            channel
                        }
                    };
                    flight::outcome(channel).await
                }
            },
            ForceRefresh::Background => match served {
                Some(entry) => {
                    tracing::trace!(key = %key, "serving cached value, refreshing in the background");
                    let this = self.clone();
                    let fallback = Some(entry.value.clone());
                    let task_key = key.clone();
                    tokio::spawn(async move {
                        let _channel = this
                            .claim_after_drain(
                                &task_key,
                                ForceRefresh::Background,
                                fallback,
                                compute,
                                hook,
                            )
                            .await;
                    });
                    Ok(entry.value)
                }
                None => {
                    let channel = self
                        .claim_after_drain(&key, ForceRefresh::Background, None, compute, hook)
                        .await;
                    flight::outcome(channel).await
                }
            },
            ForceRefresh::Blocking => {
                let channel = self
                    .claim_after_drain(&key, ForceRefresh::Blocking, None, compute, hook)
                    .await;
                flight::outcome(channel).await
            }
        }
    }

    /// Claims the flight slot for `key`, draining any in-flight computation
    /// first.
    ///
    /// A forced refresh never reuses a computation that was already running
    /// when it arrived: it waits for the slot to vacate and then hosts its
    /// own. The settled outcomes of drained flights are discarded.
    async fn claim_after_drain<C, F>(
        &self,
        key: &str,
        refresh: ForceRefresh,
        fallback: Option<T>,
        compute: C,
        hook: Option<ErrorHook>,
    ) -> FlightChannel<T>
    where
        C: FnOnce() -> F + Send + 'static,
        F: Future<Output = Result<T, ResolveError>> + Send + 'static,
    {
        let mut compute = Some(compute);
        loop {
            if let Some(existing) = self.flights.attach(key) {
                tracing::trace!(key, "draining in-flight computation before forced refresh");
                let _ = flight::outcome(existing).await;
                continue;
            }

            match self.flights.try_host(key, || {
                let computation = compute.take().expect("hosted at most once");
                Self::hosted(
                    self.store.clone(),
                    key.to_owned(),
                    refresh,
                    fallback.clone(),
                    computation(),
                    hook.clone(),
                )
            }) {
                Ok(channel) => break channel,
                // Lost the slot between draining and claiming; drain the
                // winner as well.
                Err(_) => continue,
            }
        }
    }

    /// Refreshes a stale entry in the background.
    ///
    /// The refresh is skipped when a computation for `key` is already in
    /// flight, and when the stale-refresh budget is exhausted; the stale
    /// value keeps being served in both cases.
    fn spawn_stale_refresh<C, F>(&self, key: &str, compute: C, hook: Option<ErrorHook>, fallback: T)
    where
        C: FnOnce() -> F + Send + 'static,
        F: Future<Output = Result<T, ResolveError>> + Send + 'static,
    {
        if self.flights.contains(key) {
            return;
        }

        // We count down towards zero, and if we reach or surpass it, we will
        // stop here. The budget is restored when the refresh settles.
        let stale_refreshes = Arc::clone(&self.stale_refreshes);
        if stale_refreshes.fetch_sub(1, Ordering::Relaxed) <= 0 {
            stale_refreshes.fetch_add(1, Ordering::Relaxed);

            tracing::debug!(key, "stale refresh limit reached, keeping stale value");
            return;
        }
        let done_token = OnDrop::new(move || {
            stale_refreshes.fetch_add(1, Ordering::Relaxed);
        });

        tracing::trace!(key, "spawning deduplicated refresh computation");

        let mut compute = Some(compute);
        let claimed = self.flights.try_host(key, || {
            let computation = compute.take().expect("hosted at most once");
            let hosted = Self::hosted(
                self.store.clone(),
                key.to_owned(),
                ForceRefresh::No,
                Some(fallback),
                computation(),
                hook,
            );
            async move {
                let _done_token = done_token;
                hosted.await
            }
        });

        if claimed.is_err() {
            // A concurrent caller claimed the slot in the meantime; its
            // computation refreshes the entry for this one.
            tracing::trace!(key, "refresh slot already claimed");
        }
    }

    /// Wraps a computation with the settlement policy.
    ///
    /// On success the value is written to the store wholesale. On failure the
    /// hook fires first, then the outcome is classified: forced failures
    /// always propagate; a failed blocking refresh falls back to whatever
    /// value is still stored, like the unforced call it would otherwise be
    /// retried as; a failure with a previously served value keeps that value
    /// authoritative and leaves the store untouched; anything else rejects.
    async fn hosted<F>(
        store: FreshnessStore<T>,
        key: String,
        refresh: ForceRefresh,
        fallback: Option<T>,
        computation: F,
        hook: Option<ErrorHook>,
    ) -> Result<T, ResolveError>
    where
        F: Future<Output = Result<T, ResolveError>> + Send + 'static,
    {
        match computation.await {
            Ok(value) => {
                store.insert(&key, value.clone());
                Ok(value)
            }
            Err(error) => {
                notify(hook.as_ref(), &error);

                if matches!(error, ResolveError::Forced(_)) {
                    tracing::debug!(key = %key, %error, "propagating forced failure");
                    return Err(error);
                }

                // Bounded to this single fallback read, there is no
                // recursive retry.
                if refresh == ForceRefresh::Blocking {
                    if let Some(entry) = store.get(&key) {
                        tracing::debug!(
                            key = %key,
                            %error,
                            "blocking refresh failed, falling back to stored value",
                        );
                        return Ok(entry.value);
                    }
                }

                match fallback {
                    Some(previous) => {
                        tracing::debug!(
                            key = %key,
                            %error,
                            "refresh failed, keeping previous value",
                        );
                        Ok(previous)
                    }
                    None => Err(error),
                }
            }
        }
    }
}

/// Delivers `error` to the hook, if any.
///
/// Hooks are purely observational, so a panicking hook must not affect how
/// the outcome settles.
fn notify(hook: Option<&ErrorHook>, error: &ResolveError) {
    let Some(hook) = hook else { return };

    if panic::catch_unwind(panic::AssertUnwindSafe(|| hook(error))).is_err() {
        tracing::error!(%error, "error hook panicked");
    }
}
