//! Coalesces delivery triggers (spool writes, manual kicks) between drains.
//!
//! A burst of newly-spooled messages should wake the delivery loop once, not
//! once per message. Submitters call [`TriggerCoalescer::submit`] from
//! wherever a trigger originates (the spool watcher, `empathctl`, retry
//! scheduling); a single drainer task calls [`TriggerCoalescer::poll`] in a
//! loop and sees each distinct scope at most once per drain cycle.

use std::collections::HashSet;

use parking_lot::Mutex;
use tokio::sync::Notify;

/// What a trigger applies to.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum TriggerScope {
    /// Re-scan and process the whole queue.
    Full,
    /// Re-scan and process only messages destined for this domain.
    Domain(String),
}

/// A coalesced batch of triggers, returned from [`TriggerCoalescer::poll`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TriggerOutcome {
    /// A full-scope trigger was submitted; any domain-scoped triggers in the
    /// same batch are subsumed by it.
    Full,
    /// Only domain-scoped triggers were submitted this batch.
    Domains(Vec<String>),
}

#[derive(Debug, Default)]
struct Pending {
    full: bool,
    domains: HashSet<String>,
}

impl Pending {
    const fn is_empty(&self) -> bool {
        !self.full && self.domains.is_empty()
    }
}

/// Coalesces [`TriggerScope`] submissions into a single pending wakeup.
#[derive(Debug, Default)]
pub struct TriggerCoalescer {
    pending: Mutex<Pending>,
    notify: Notify,
}

impl TriggerCoalescer {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a trigger. Cheap and non-blocking; safe to call from many
    /// concurrent submitters.
    pub fn submit(&self, scope: TriggerScope) {
        {
            let mut pending = self.pending.lock();
            match scope {
                TriggerScope::Full => pending.full = true,
                TriggerScope::Domain(domain) => {
                    pending.domains.insert(domain);
                }
            }
        }
        self.notify.notify_one();
    }

    /// Wait for the next trigger, then drain and return everything that
    /// coalesced while waiting.
    ///
    /// Only one task should call this at a time; `poll` is meant to back a
    /// single drainer loop, not to be fanned out across workers.
    pub async fn poll(&self) -> TriggerOutcome {
        loop {
            {
                let mut pending = self.pending.lock();
                if pending.full {
                    *pending = Pending::default();
                    return TriggerOutcome::Full;
                }
                if !pending.domains.is_empty() {
                    let domains = std::mem::take(&mut pending.domains).into_iter().collect();
                    return TriggerOutcome::Domains(domains);
                }
            }
            self.notify.notified().await;
        }
    }

    /// Whether a trigger is currently pending (not yet drained by `poll`).
    #[must_use]
    pub fn has_pending(&self) -> bool {
        !self.pending.lock().is_empty()
    }
}
