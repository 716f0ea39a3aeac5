//! Single-flight execution.
//!
//! At most one execution runs per cache key. The first request for a key
//! spawns it; later requests join and wait for the same outcome. Each
//! execution counts the requests interested in it: a request that is
//! cancelled or abandoned withdraws, and the execution itself is cancelled
//! once nobody is left waiting. A waiter dropped while its request is still
//! live (the request stopped caring because a sibling failed) leaves the
//! execution running so its result still reaches the cache.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use futures::future::BoxFuture;
use parking_lot::Mutex;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::trace;

use crate::execute::ResolvedResult;
use crate::util::hash::Fingerprint;

use super::error::ResolveError;

pub(crate) type Outcome = Result<ResolvedResult, ResolveError>;

struct Flight {
  id: u64,
  rx: watch::Receiver<Option<Outcome>>,
  interest: usize,
  /// Set when a waiter went away without withdrawing; later withdrawals
  /// then leave the flight running. Cleared when a new request joins.
  detached: bool,
  cancel: CancellationToken,
}

#[derive(Default)]
pub(crate) struct FlightMap {
  flights: Mutex<HashMap<Fingerprint, Flight>>,
  next_id: AtomicU64,
}

impl FlightMap {
  /// Join the flight for `key` on behalf of the request owning `request`,
  /// or start one by calling `start` with the flight's cancellation token.
  pub fn join<F>(self: &Arc<Self>, key: &Fingerprint, request: &CancellationToken, start: F) -> Waiter
  where
    F: FnOnce(CancellationToken) -> BoxFuture<'static, Outcome>,
  {
    let mut flights = self.flights.lock();

    if let Some(flight) = flights.get_mut(key)
      && !flight.cancel.is_cancelled()
    {
      flight.interest += 1;
      flight.detached = false;
      trace!(key = %key.short(), interest = flight.interest, "joined flight");
      return Waiter {
        map: Arc::clone(self),
        key: key.clone(),
        id: flight.id,
        rx: flight.rx.clone(),
        request: request.clone(),
        done: false,
      };
    }

    let id = self.next_id.fetch_add(1, Ordering::Relaxed);
    let (tx, rx) = watch::channel(None);
    let cancel = CancellationToken::new();
    flights.insert(
      key.clone(),
      Flight {
        id,
        rx: rx.clone(),
        interest: 1,
        detached: false,
        cancel: cancel.clone(),
      },
    );
    drop(flights);

    trace!(key = %key.short(), id, "flight started");

    let work = start(cancel);
    let map = Arc::clone(self);
    let finished_key = key.clone();
    tokio::spawn(async move {
      let outcome = work.await;
      let _ = tx.send(Some(outcome));
      map.finish(&finished_key, id);
    });

    Waiter {
      map: Arc::clone(self),
      key: key.clone(),
      id,
      rx,
      request: request.clone(),
      done: false,
    }
  }

  /// Number of executions currently registered.
  pub fn len(&self) -> usize {
    self.flights.lock().len()
  }

  fn finish(&self, key: &Fingerprint, id: u64) {
    let mut flights = self.flights.lock();
    if flights.get(key).is_some_and(|f| f.id == id) {
      flights.remove(key);
    }
  }

  fn release(&self, key: &Fingerprint, id: u64, withdraw: bool) {
    let mut flights = self.flights.lock();
    let Some(flight) = flights.get_mut(key) else {
      return;
    };
    if flight.id != id {
      return;
    }

    flight.interest = flight.interest.saturating_sub(1);
    if !withdraw {
      flight.detached = true;
      return;
    }
    if flight.interest == 0 && !flight.detached {
      trace!(key = %key.short(), id, "last waiter withdrew; cancelling flight");
      flight.cancel.cancel();
      flights.remove(key);
    }
  }
}

/// One request's interest in a flight.
pub(crate) struct Waiter {
  map: Arc<FlightMap>,
  key: Fingerprint,
  id: u64,
  rx: watch::Receiver<Option<Outcome>>,
  request: CancellationToken,
  done: bool,
}

impl Waiter {
  /// Wait for the outcome, or withdraw when the request is cancelled.
  ///
  /// `None` means the execution ended without reporting an outcome.
  pub async fn wait(mut self) -> Option<Outcome> {
    let mut rx = self.rx.clone();
    let cancel = self.request.clone();
    let result = async move { rx.wait_for(Option::is_some).await.ok().and_then(|v| v.clone()) };

    tokio::select! {
      outcome = result => {
        self.done = true;
        outcome
      }
      _ = cancel.cancelled() => {
        self.done = true;
        self.map.release(&self.key, self.id, true);
        Some(Err(ResolveError::Cancelled))
      }
    }
  }
}

impl Drop for Waiter {
  fn drop(&mut self) {
    if !self.done {
      self.map.release(&self.key, self.id, self.request.is_cancelled());
    }
  }
}
