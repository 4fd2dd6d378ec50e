//! Replicator membership and role maturity.
//!
//! [`Membership`] turns changes of the replication index into
//! [`ReplicatorJoined`], [`ReplicatorLeft`] and [`ReplicatorMature`] events.
//! Each segment gets one maturity timer. A timer that fires removes itself
//! from the pending table; replacing or removing a segment aborts its timer.
//! The table therefore drains back to empty once every armed timer has fired
//! or been cancelled.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use eddy_replication::ReplicationSegment;
use eddy_types::events::{EventBus, ReplicatorJoined, ReplicatorLeft, ReplicatorMature};
use eddy_types::{PeerId, SegmentId};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info};

type TimerKey = (PeerId, SegmentId);

#[derive(Default)]
struct Timers {
    generation: u64,
    pending: HashMap<TimerKey, (u64, JoinHandle<()>)>,
}

impl Timers {
    fn cancel(&mut self, key: &TimerKey) -> bool {
        match self.pending.remove(key) {
            Some((_, handle)) => {
                handle.abort();
                true
            }
            None => false,
        }
    }
}

pub(crate) struct Membership {
    events: EventBus,
    maturity: Duration,
    owners: HashSet<PeerId>,
    timers: Arc<Mutex<Timers>>,
    matured: mpsc::UnboundedSender<TimerKey>,
}

impl Membership {
    /// `matured` receives `(owner, segment)` whenever a timer fires.
    pub(crate) fn new(
        events: EventBus,
        maturity: Duration,
        matured: mpsc::UnboundedSender<TimerKey>,
    ) -> Self {
        Self {
            events,
            maturity,
            owners: HashSet::new(),
            timers: Arc::new(Mutex::new(Timers::default())),
            matured,
        }
    }

    /// Apply a change to `owner`'s segments. `remaining` is the number of
    /// segments the owner holds after the change.
    pub(crate) fn update(
        &mut self,
        owner: PeerId,
        removed: &[ReplicationSegment],
        added: &[ReplicationSegment],
        remaining: usize,
        now_ms: u64,
    ) {
        {
            let mut timers = self.timers.lock().expect("timer lock poisoned");
            for segment in removed {
                if timers.cancel(&(owner, segment.id)) {
                    debug!(%owner, segment = %segment.id, "maturity timer cancelled");
                }
            }
        }

        if remaining == 0 {
            self.cancel_owner(&owner);
            if self.owners.remove(&owner) {
                info!(%owner, "replicator left");
                self.events.emit(ReplicatorLeft { peer: owner });
            }
            return;
        }

        if self.owners.insert(owner) {
            info!(%owner, "replicator joined");
            self.events.emit(ReplicatorJoined { peer: owner });
        }
        for segment in added {
            self.arm(segment, now_ms);
        }
    }

    fn arm(&self, segment: &ReplicationSegment, now_ms: u64) {
        let key = (segment.owner, segment.id);
        let age = Duration::from_millis(now_ms.saturating_sub(segment.created_at));
        let delay = self.maturity.saturating_sub(age);

        let mut timers = self.timers.lock().expect("timer lock poisoned");
        timers.cancel(&key);
        timers.generation += 1;
        let generation = timers.generation;

        let shared = Arc::clone(&self.timers);
        let events = self.events.clone();
        let matured = self.matured.clone();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            {
                let mut timers = shared.lock().expect("timer lock poisoned");
                match timers.pending.get(&key) {
                    Some((g, _)) if *g == generation => {
                        timers.pending.remove(&key);
                    }
                    // Superseded between waking up and taking the lock.
                    _ => return,
                }
            }
            info!(owner = %key.0, segment = %key.1, "replicator matured");
            events.emit(ReplicatorMature {
                peer: key.0,
                segment: key.1,
            });
            let _ = matured.send(key);
        });
        timers.pending.insert(key, (generation, handle));
    }

    fn cancel_owner(&self, owner: &PeerId) {
        let mut timers = self.timers.lock().expect("timer lock poisoned");
        let keys: Vec<TimerKey> = timers
            .pending
            .keys()
            .filter(|(o, _)| o == owner)
            .copied()
            .collect();
        for key in keys {
            timers.cancel(&key);
        }
    }

    /// Number of armed maturity timers.
    pub(crate) fn pending(&self) -> usize {
        self.timers.lock().expect("timer lock poisoned").pending.len()
    }

    /// Abort every timer.
    pub(crate) fn shutdown(&mut self) {
        let mut timers = self.timers.lock().expect("timer lock poisoned");
        for (_, (_, handle)) in timers.pending.drain() {
            handle.abort();
        }
        self.owners.clear();
    }
}
