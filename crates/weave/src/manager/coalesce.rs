//! Sharing results between overlapping sync requests
//!
//! A request registers the collections it will sync before it waits for the
//! sync lock. A later request for any of those collections joins the
//! registered attempt and takes its statuses instead of syncing them again.

use std::collections::BTreeSet;
use std::sync::{Arc, Mutex};

use tokio::sync::watch;

use crate::synchronizers::{NotStartedReason, SyncStatus};

/// Statuses of one sync attempt, in dispatch order
pub type SyncResults = Vec<(String, SyncStatus)>;

type Outcome = Option<Arc<SyncResults>>;

struct Attempt {
    id: u64,
    collections: BTreeSet<String>,
    done: watch::Receiver<Outcome>,
}

#[derive(Default)]
struct Registry {
    next_id: u64,
    attempts: Vec<Attempt>,
}

/// Attempts that are queued or running
#[derive(Default)]
pub struct InFlightSyncs {
    registry: Mutex<Registry>,
}

/// Collections covered by an attempt someone else registered
pub struct Joined {
    pub collections: Vec<String>,
    done: watch::Receiver<Outcome>,
}

impl Joined {
    /// Wait for the attempt and take the statuses of our collections
    pub async fn results(mut self) -> SyncResults {
        loop {
            let current = self.done.borrow_and_update().clone();
            if let Some(results) = current {
                return self.pick(&results);
            }
            if self.done.changed().await.is_err() {
                let outcome = self.done.borrow().clone();
                return match outcome {
                    Some(results) => self.pick(&results),
                    None => {
                        log::warn!("Joined sync attempt ended without results");
                        self.collections
                            .iter()
                            .map(|c| (c.clone(), SyncStatus::NotStarted(NotStartedReason::Unknown)))
                            .collect()
                    }
                };
            }
        }
    }

    fn pick(&self, results: &SyncResults) -> SyncResults {
        results
            .iter()
            .filter(|(collection, _)| self.collections.contains(collection))
            .cloned()
            .collect()
    }
}

/// An attempt this caller must run. Unregisters itself when dropped.
pub struct Registration<'a> {
    registry: &'a InFlightSyncs,
    id: u64,
    done: watch::Sender<Outcome>,
    pub collections: Vec<String>,
}

impl Registration<'_> {
    /// Publish the attempt's statuses to everyone who joined it
    pub fn complete(self, results: &SyncResults) {
        // Unregister first so nobody joins after the value is sent
        self.registry.remove(self.id);
        self.done.send_replace(Some(Arc::new(results.clone())));
    }
}

impl Drop for Registration<'_> {
    fn drop(&mut self) {
        self.registry.remove(self.id);
    }
}

impl InFlightSyncs {
    pub fn new() -> Self {
        Self::default()
    }

    /// Join attempts covering any of `wanted` and register the rest
    ///
    /// Returns `None` for the registration when every collection is covered.
    pub fn join_or_register(&self, wanted: &[String]) -> (Vec<Joined>, Option<Registration<'_>>) {
        let mut registry = self.registry.lock().unwrap();
        let mut remaining = wanted.to_vec();
        let mut joined = Vec::new();

        for attempt in &registry.attempts {
            let (covered, rest): (Vec<String>, Vec<String>) = remaining
                .into_iter()
                .partition(|c| attempt.collections.contains(c));
            remaining = rest;
            if !covered.is_empty() {
                log::debug!("Joining in-flight sync {} for {:?}", attempt.id, covered);
                joined.push(Joined {
                    collections: covered,
                    done: attempt.done.clone(),
                });
            }
        }

        if remaining.is_empty() {
            return (joined, None);
        }

        let id = registry.next_id;
        registry.next_id += 1;
        let (tx, rx) = watch::channel(None);
        registry.attempts.push(Attempt {
            id,
            collections: remaining.iter().cloned().collect(),
            done: rx,
        });

        let registration = Registration {
            registry: self,
            id,
            done: tx,
            collections: remaining,
        };
        (joined, Some(registration))
    }

    /// Number of attempts queued or running
    pub fn len(&self) -> usize {
        self.registry.lock().unwrap().attempts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn remove(&self, id: u64) {
        self.registry.lock().unwrap().attempts.retain(|a| a.id != id);
    }
}
