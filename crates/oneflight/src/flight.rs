use std::collections::BTreeMap;
use std::future::Future;
use std::sync::{Arc, Mutex};

use futures::channel::oneshot;
use futures::future::{FutureExt, Shared};

use crate::defer::OnDrop;
use crate::error::ResolveError;

/// The channel over which every caller attached to a key's in-flight
/// computation observes the one settled outcome.
pub(crate) type FlightChannel<T> = Shared<oneshot::Receiver<Result<T, ResolveError>>>;

type FlightMap<T> = Arc<Mutex<BTreeMap<String, FlightChannel<T>>>>;

/// Tracks, per key, the single computation currently in flight.
///
/// At most one computation runs per key at any instant. The registry only
/// ever hands out the existing channel or claims a vacant slot; draining an
/// unwanted flight and starting over is [`Resolver`](crate::Resolver) policy.
pub(crate) struct FlightRegistry<T> {
    flights: FlightMap<T>,
}

impl<T> Clone for FlightRegistry<T> {
    fn clone(&self) -> Self {
        FlightRegistry {
            flights: Arc::clone(&self.flights),
        }
    }
}

impl<T> FlightRegistry<T>
where
    T: Clone + Send + Sync + 'static,
{
    pub fn new() -> Self {
        FlightRegistry {
            flights: Arc::new(Mutex::new(BTreeMap::new())),
        }
    }

    /// Whether a computation is currently in flight for `key`.
    pub fn contains(&self, key: &str) -> bool {
        self.flights.lock().unwrap().contains_key(key)
    }

    /// Joins the computation currently in flight for `key`, if any.
    ///
    /// The returned channel observes the flight's outcome without starting
    /// any new work.
    pub fn attach(&self, key: &str) -> Option<FlightChannel<T>> {
        self.flights.lock().unwrap().get(key).cloned()
    }

    /// Claims the slot for `key` and hosts `make()` as its computation, or
    /// joins the existing flight if the slot is occupied.
    ///
    /// `make` is invoked only when the slot is claimed. The hosted
    /// computation is spawned eagerly on the current runtime, so it settles
    /// whether or not the returned channel is awaited. The slot is vacated
    /// before the outcome is published: a caller that has observed the
    /// settled channel can immediately host a new flight.
    pub fn try_host<F, Fut>(&self, key: &str, make: F) -> Result<FlightChannel<T>, FlightChannel<T>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, ResolveError>> + Send + 'static,
    {
        let mut flights = self.flights.lock().unwrap();
        if let Some(channel) = flights.get(key) {
            return Err(channel.clone());
        }

        let (sender, receiver) = oneshot::channel();

        let vacate_token = {
            let key = key.to_owned();
            let flights = Arc::clone(&self.flights);
            OnDrop::new(move || {
                flights.lock().unwrap().remove(&key);
            })
        };

        let computation = make();
        let flight = async move {
            let outcome = computation.await;
            // Drop the token first to vacate the slot. This ensures that
            // callers either get a channel that will receive the outcome, or
            // they host a new flight.
            drop(vacate_token);
            sender.send(outcome).ok();
        };
        tokio::spawn(flight);

        let channel = receiver.shared();
        let evicted = flights.insert(key.to_owned(), channel.clone());
        debug_assert!(evicted.is_none());
        Ok(channel)
    }

    pub fn len(&self) -> usize {
        self.flights
            .try_lock()
            .map(|flights| flights.len())
            .unwrap_or_default()
    }
}

/// Awaits a flight's settled outcome.
///
/// A host torn down before settling, for example during runtime shutdown,
/// surfaces as [`ResolveError::Interrupted`].
pub(crate) async fn outcome<T: Clone>(channel: FlightChannel<T>) -> Result<T, ResolveError> {
    channel
        .await
        .unwrap_or_else(|_cancelled| Err(ResolveError::Interrupted))
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_attachers_observe_host_outcome() {
        let registry = FlightRegistry::new();

        let hosted = registry
            .try_host("key", || async {
                tokio::time::sleep(Duration::from_millis(100)).await;
                Ok(String::from("value"))
            })
            .expect("slot was vacant");

        assert!(registry.contains("key"));
        let attached = registry.attach("key").expect("flight is registered");

        let (hosted, attached) = futures::join!(outcome(hosted), outcome(attached));
        assert_eq!(hosted.unwrap(), "value");
        assert_eq!(attached.unwrap(), "value");
    }

    #[tokio::test]
    async fn test_slot_is_vacated_on_settlement() {
        let registry = FlightRegistry::new();

        let hosted = registry
            .try_host("key", || async { Ok(String::from("first")) })
            .expect("slot was vacant");
        assert!(outcome(hosted).await.is_ok());

        assert!(!registry.contains("key"));
        assert!(registry.attach("key").is_none());

        // The vacated slot can immediately host a fresh flight.
        let hosted = registry
            .try_host("key", || async { Ok(String::from("second")) })
            .expect("slot was vacated");
        assert_eq!(outcome(hosted).await.unwrap(), "second");
    }

    #[tokio::test]
    async fn test_occupied_slot_joins_instead() {
        let registry = FlightRegistry::new();

        let hosted = registry
            .try_host("key", || async { Ok(String::from("first")) })
            .expect("slot was vacant");

        let joined = registry
            .try_host("key", || async { Ok(String::from("second")) })
            .expect_err("slot was occupied");

        let (hosted, joined) = futures::join!(outcome(hosted), outcome(joined));
        assert_eq!(hosted.unwrap(), "first");
        assert_eq!(joined.unwrap(), "first");
    }

    #[tokio::test]
    async fn test_failures_are_broadcast() {
        let registry: FlightRegistry<String> = FlightRegistry::new();

        let hosted = registry
            .try_host("key", || async {
                Err(ResolveError::Computation("boom".into()))
            })
            .expect("slot was vacant");
        let attached = registry.attach("key").expect("flight is registered");

        let (hosted, attached) = futures::join!(outcome(hosted), outcome(attached));
        assert_eq!(hosted, Err(ResolveError::Computation("boom".into())));
        assert_eq!(attached, Err(ResolveError::Computation("boom".into())));
    }

    #[tokio::test]
    async fn test_dropped_channel_is_interrupted() {
        let (sender, receiver) = oneshot::channel::<Result<String, ResolveError>>();
        drop(sender);

        let result = outcome(receiver.shared()).await;
        assert_eq!(result, Err(ResolveError::Interrupted));
    }
}
