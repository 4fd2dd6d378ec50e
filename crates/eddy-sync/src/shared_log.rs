//! A log shared between peers.
//!
//! [`SharedLog`] wraps a [`Log`] with a replication index and a transport.
//! Local appends are gossiped to the replicators responsible for them,
//! heads received from peers are joined, and replicators negotiate which
//! entries still need transferring before sending them.
//!
//! Appends, joins and trims are serialized through the log's async mutex.
//! Replication index mutations and coverage reads are serialized through the
//! sync state mutex, so a coverage query never observes a half-applied
//! segment update.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::{Duration, Instant};

use eddy_log::{
    AppendOptions, AppendResult, BlockStore, Entry, HlcConfig, Identity, JoinItem, JoinOptions,
    JoinResult, Log, LogOptions, Payload, TrimOptions,
};
use eddy_replication::{
    get_cover, select_from, CoverRange, HashDomain, ReplicationDomain, ReplicationError,
    ReplicationIndex, ReplicationSegment, ReplicationSpec, SegmentQuery,
};
use eddy_types::config::EddyConfig;
use eddy_types::events::{EntriesJoined, EventBus};
use eddy_types::{unix_millis, EntryHash, PeerId, SegmentId};
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::batcher::{Head, HeadBatcher};
use crate::error::SyncError;
use crate::in_flight::{InFlight, Wanted};
use crate::membership::Membership;
use crate::message::SyncMessage;
use crate::retention::ReplicationTrimFilter;
use crate::transport::{Transport, TransportEvent, TransportEvents};

type Result<T> = std::result::Result<T, SyncError>;

/// Offers larger than this travel as entry numbers instead of hashes.
const COORDINATE_OFFER_THRESHOLD: usize = 64;

/// Upper bound between readiness checks in [`SharedLog::wait_for_replicators`].
const WAIT_POLL: Duration = Duration::from_millis(100);

/// Construction options for [`SharedLog::open`].
#[derive(Clone)]
pub struct SharedLogOptions {
    /// Replicators responsible for each entry.
    pub replicas: usize,
    /// How long a segment must exist before its owner counts as mature.
    pub role_maturity: Duration,
    /// Head batching window.
    pub debounce: Duration,
    /// Lifetime of an unanswered sync request.
    pub in_flight_ttl: Duration,
    /// Largest message sent or accepted.
    pub max_message_size: usize,
    /// How long [`SharedLog::join`] waits for entries requested from peers.
    pub fetch_timeout: Duration,
    /// Maps entries onto the ring.
    pub domain: Arc<dyn ReplicationDomain>,
    /// Options for the underlying log. A configured retention only drops
    /// entries the replication state no longer needs locally.
    pub log: LogOptions,
    /// Segments to claim right after opening.
    pub replicate: Option<ReplicationSpec>,
}

impl Default for SharedLogOptions {
    fn default() -> Self {
        Self {
            replicas: 2,
            role_maturity: Duration::from_secs(60),
            debounce: Duration::from_millis(25),
            in_flight_ttl: Duration::from_secs(30),
            max_message_size: 8 * 1024 * 1024,
            fetch_timeout: Duration::from_secs(5),
            domain: Arc::new(HashDomain),
            log: LogOptions::default(),
            replicate: None,
        }
    }
}

impl SharedLogOptions {
    /// Options derived from a peer configuration.
    pub fn from_config(config: &EddyConfig) -> Result<Self> {
        let trim = config
            .trim
            .as_ref()
            .map(TrimOptions::try_from)
            .transpose()?;
        Ok(Self {
            replicas: config.replication.replicas,
            role_maturity: config.replication.time_until_role_maturity(),
            debounce: config.sync.debounce(),
            in_flight_ttl: config.sync.in_flight_ttl(),
            max_message_size: config.sync.max_message_size,
            fetch_timeout: config.sync.fetch_timeout(),
            domain: eddy_replication::from_config(&config.replication),
            log: LogOptions {
                clock: HlcConfig::from(&config.clock),
                trim,
                can_append: None,
            },
            replicate: None,
        })
    }
}

/// Per-call options for [`SharedLog::join`].
#[derive(Clone, Default)]
pub struct SharedJoinOptions {
    /// Also claim the coordinates of the joined entries and gossip them.
    pub replicate: bool,
    /// Overrides [`SharedLogOptions::fetch_timeout`] for this call.
    pub fetch_timeout: Option<Duration>,
    /// Options passed to [`Log::join`].
    pub join: JoinOptions,
}

/// Options for [`SharedLog::get_cover`].
#[derive(Clone, Default)]
pub struct CoverOptions {
    /// Minimum segment age. Defaults to the configured role maturity.
    pub role_age: Option<Duration>,
    /// Resolve with an empty result once this fires.
    pub signal: Option<CancellationToken>,
}

/// Options for [`SharedLog::wait_for_replicators`].
#[derive(Clone, Default)]
pub struct WaitOptions {
    /// Minimum segment age. Defaults to the configured role maturity.
    pub role_age: Option<Duration>,
    /// Fail with [`SyncError::Timeout`] after this long.
    pub timeout: Option<Duration>,
    /// Fail with [`SyncError::Aborted`] once this fires.
    pub signal: Option<CancellationToken>,
}

struct SyncState {
    closed: bool,
    membership: Membership,
    in_flight: InFlight,
}

pub(crate) struct Inner {
    peer: PeerId,
    replicas: usize,
    role_maturity: Duration,
    max_message_size: usize,
    fetch_timeout: Duration,
    domain: Arc<dyn ReplicationDomain>,
    log: tokio::sync::Mutex<Log>,
    index: ReplicationIndex,
    /// Bumped whenever the index or the maturity of a segment changes.
    index_version: AtomicU64,
    state: Mutex<SyncState>,
    transport: Arc<dyn Transport>,
    batcher: HeadBatcher,
    events: EventBus,
    changed: Notify,
    cancel: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

/// A replicated log bound to a transport. Cheap to clone.
#[derive(Clone)]
pub struct SharedLog {
    inner: Arc<Inner>,
}

impl SharedLog {
    /// Open a shared log and start its receive loop.
    ///
    /// Segments of other peers left in a persisted `index` are discarded
    /// (they are re-announced on reconnect); the local peer's segments are
    /// re-stamped so their role age restarts now.
    pub async fn open(
        identity: Arc<dyn Identity>,
        store: Arc<dyn BlockStore>,
        index: ReplicationIndex,
        transport: Arc<dyn Transport>,
        transport_events: TransportEvents,
        options: SharedLogOptions,
    ) -> Result<Self> {
        let SharedLogOptions {
            replicas,
            role_maturity,
            debounce,
            in_flight_ttl,
            max_message_size,
            fetch_timeout,
            domain,
            log: log_options,
            replicate,
        } = options;
        let peer = identity.peer_id();
        if transport.local_peer() != peer {
            warn!(%peer, transport = %transport.local_peer(), "transport speaks for another peer");
        }

        let now = unix_millis();
        for owner in index.owners(&SegmentQuery::all())? {
            if owner != peer {
                index.del_owner(&owner)?;
            }
        }
        let resumed = index.restamp_owner(&peer, now)?;

        let events = EventBus::new();
        let (matured_tx, matured_rx) = mpsc::unbounded_channel();
        let mut membership = Membership::new(events.clone(), role_maturity, matured_tx);
        if !resumed.is_empty() {
            info!(%peer, segments = resumed.len(), "resuming replication");
            membership.update(peer, &[], &resumed, resumed.len(), now);
        }

        let cancel = CancellationToken::new();
        let (batcher, batch_task) = HeadBatcher::spawn(
            Arc::clone(&transport),
            debounce,
            max_message_size,
            cancel.child_token(),
        );

        let inner = Arc::new_cyclic(|weak: &Weak<Inner>| {
            let mut log_options = log_options;
            log_options.trim = log_options
                .trim
                .take()
                .map(|trim| ReplicationTrimFilter::wrap(weak.clone(), trim));
            Inner {
                peer,
                replicas,
                role_maturity,
                max_message_size,
                fetch_timeout,
                domain,
                log: tokio::sync::Mutex::new(Log::new(identity, store, log_options)),
                index,
                index_version: AtomicU64::new(0),
                state: Mutex::new(SyncState {
                    closed: false,
                    membership,
                    in_flight: InFlight::new(in_flight_ttl),
                }),
                transport,
                batcher,
                events,
                changed: Notify::new(),
                cancel,
                tasks: Mutex::new(vec![batch_task]),
            }
        });

        let receive_task = tokio::spawn(receive_loop(
            Arc::clone(&inner),
            transport_events,
            matured_rx,
        ));
        inner
            .tasks
            .lock()
            .expect("task lock poisoned")
            .push(receive_task);

        let log = SharedLog { inner };
        if !resumed.is_empty() {
            log.inner
                .broadcast(SyncMessage::AllReplicatingSegments { segments: resumed })
                .await;
        }
        if let Some(spec) = replicate {
            log.replicate(spec, true).await?;
        }
        debug!(%peer, "shared log opened");
        Ok(log)
    }

    pub fn peer_id(&self) -> PeerId {
        self.inner.peer
    }

    /// Membership and join events of this log.
    pub fn events(&self) -> &EventBus {
        &self.inner.events
    }

    /// Exclusive access to the underlying log.
    ///
    /// Appends and joins wait while the guard is held.
    pub async fn log(&self) -> tokio::sync::MutexGuard<'_, Log> {
        self.inner.log.lock().await
    }

    /// Append locally and gossip the entry to its replicators.
    pub async fn append(&self, payload: Payload, options: AppendOptions) -> Result<AppendResult> {
        self.inner.ensure_open()?;
        let result = {
            let mut log = self.inner.log.lock().await;
            log.append(payload, options).await?
        };
        debug!(hash = %result.entry.hash(), "appended");
        self.inner.gossip(std::slice::from_ref(&result.entry))?;
        Ok(result)
    }

    /// Merge entries into the log.
    ///
    /// Hashes and shallow entries missing from the local block store are
    /// requested from connected peers, waiting at most the fetch timeout for
    /// them; whatever is still absent afterwards is reported in
    /// [`JoinResult::missing`].
    ///
    /// With `replicate`, the local peer also claims the coordinates of the
    /// joined entries and gossips the new ones to their replicators.
    pub async fn join<I, T>(&self, items: I, options: SharedJoinOptions) -> Result<JoinResult>
    where
        I: IntoIterator<Item = T>,
        T: Into<JoinItem>,
    {
        self.inner.ensure_open()?;
        let items: Vec<JoinItem> = items.into_iter().map(Into::into).collect();
        let requested: Vec<EntryHash> = items.iter().map(item_hash).collect();

        let mut result = {
            let mut log = self.inner.log.lock().await;
            log.join(items, options.join).await?
        };
        self.inner.joined(None, &result);

        let unresolved: Vec<EntryHash> = requested
            .iter()
            .filter(|h| result.missing.binary_search(*h).is_ok())
            .copied()
            .collect();
        if !unresolved.is_empty() {
            let timeout = options.fetch_timeout.unwrap_or(self.inner.fetch_timeout);
            self.fetch(&unresolved, timeout, &mut result).await?;
        }

        if options.replicate {
            let present: Vec<Entry> = {
                let log = self.inner.log.lock().await;
                requested
                    .iter()
                    .filter_map(|h| log.get(h).cloned())
                    .collect()
            };
            self.replicate_entries(&present).await?;
            self.inner.gossip(&result.added)?;
        }
        Ok(result)
    }

    /// Ask peers for `hashes` and wait until they are joined or `timeout`
    /// passes. Entries that arrived are folded into `result`.
    async fn fetch(
        &self,
        hashes: &[EntryHash],
        timeout: Duration,
        result: &mut JoinResult,
    ) -> Result<()> {
        let inner = &self.inner;
        let sources = inner.fetch_sources()?;
        if sources.is_empty() {
            debug!(count = hashes.len(), "no peer to fetch missing entries from");
            return Ok(());
        }

        let known: HashSet<EntryHash> = {
            let log = inner.log.lock().await;
            log.values().iter().map(|e| e.hash()).collect()
        };
        {
            let now = Instant::now();
            let mut state = inner.lock_state();
            for peer in &sources {
                for hash in hashes {
                    state.in_flight.record(*peer, Wanted::Hash(*hash), now);
                }
            }
        }

        debug!(count = hashes.len(), peers = sources.len(), "fetching missing entries");
        for peer in &sources {
            let request = SyncMessage::ResponseMaybeSync {
                hashes: hashes.to_vec(),
            };
            if let Err(e) = inner.send(*peer, request).await {
                warn!(%peer, error = %e, "fetch request failed");
            }
        }

        if tokio::time::timeout(timeout, inner.wait_present(hashes))
            .await
            .is_err()
        {
            debug!(count = hashes.len(), ?timeout, "gave up waiting for missing entries");
        }

        let log = inner.log.lock().await;
        let arrived: Vec<EntryHash> = hashes.iter().filter(|h| log.has(h)).copied().collect();
        result.added.extend(log.ancestry(&arrived, &known));
        result.missing.retain(|h| !log.has(h));
        drop(log);

        let mut state = inner.lock_state();
        for hash in hashes {
            state.in_flight.resolve(hash);
        }
        Ok(())
    }

    async fn replicate_entries(&self, entries: &[Entry]) -> Result<()> {
        let own = self.segments()?;
        let mut coordinates: Vec<u32> = entries
            .iter()
            .map(|e| self.inner.domain.from_entry(e))
            .filter(|c| !own.iter().any(|s| s.contains(*c)))
            .collect();
        coordinates.sort_unstable();
        coordinates.dedup();
        if coordinates.is_empty() {
            return Ok(());
        }
        self.replicate(ReplicationSpec::Entries(coordinates), false)
            .await?;
        Ok(())
    }

    /// Claim segments of the ring.
    ///
    /// With `reset`, the new segments replace every existing local segment
    /// and maturity restarts for them. Otherwise they are added.
    pub async fn replicate(
        &self,
        spec: ReplicationSpec,
        reset: bool,
    ) -> Result<Vec<ReplicationSegment>> {
        let inner = &self.inner;
        let now = unix_millis();
        let (added, all) = {
            let mut state = inner.lock_state();
            if state.closed {
                return Err(SyncError::Closed);
            }
            let others: Vec<ReplicationSegment> = inner
                .index
                .iterate(&SegmentQuery::all())?
                .into_iter()
                .filter(|s| s.owner != inner.peer)
                .collect();
            let segments = spec.resolve(inner.peer, &others)?;
            let removed = if reset {
                inner.index.del_owner(&inner.peer)?
            } else {
                Vec::new()
            };
            for segment in &segments {
                inner.index.put(segment)?;
            }
            let all = inner.index.by_owner(&inner.peer)?;
            state
                .membership
                .update(inner.peer, &removed, &segments, all.len(), now);
            (segments, all)
        };
        inner.index_changed();
        info!(peer = %inner.peer, segments = added.len(), reset, "replicating");

        let announcement = if reset {
            SyncMessage::AllReplicatingSegments { segments: all }
        } else {
            SyncMessage::AddedReplicationSegments {
                segments: added.clone(),
            }
        };
        inner.broadcast(announcement).await;
        Ok(added)
    }

    /// Stop replicating and tell every peer.
    pub async fn unreplicate(&self) -> Result<()> {
        let inner = &self.inner;
        {
            let mut state = inner.lock_state();
            if state.closed {
                return Err(SyncError::Closed);
            }
            let removed = inner.index.del_owner(&inner.peer)?;
            state
                .membership
                .update(inner.peer, &removed, &[], 0, unix_millis());
        }
        inner.index_changed();
        info!(peer = %inner.peer, "stopped replicating");
        inner
            .broadcast(SyncMessage::AllReplicatingSegments {
                segments: Vec::new(),
            })
            .await;
        Ok(())
    }

    /// Segments the local peer replicates.
    pub fn segments(&self) -> Result<Vec<ReplicationSegment>> {
        let inner = &self.inner;
        inner.read_index(|index| index.by_owner(&inner.peer))
    }

    pub fn segment_count(&self) -> Result<usize> {
        Ok(self.segments()?.len())
    }

    /// Every known segment, local ones included.
    pub fn all_segments(&self) -> Result<Vec<ReplicationSegment>> {
        self.inner
            .read_index(|index| index.iterate(&SegmentQuery::all()))
    }

    /// Mature replicators whose segments intersect `range`.
    ///
    /// Never fails: a closed log, a close racing this call, an aborted
    /// signal or an index error all yield an empty list.
    pub async fn get_cover(&self, range: CoverRange, options: CoverOptions) -> Vec<PeerId> {
        let aborted = || options.signal.as_ref().is_some_and(|s| s.is_cancelled());
        if aborted() {
            return Vec::new();
        }
        let role_age = options.role_age.unwrap_or(self.inner.role_maturity);
        let cover = {
            let state = self.inner.lock_state();
            if state.closed {
                return Vec::new();
            }
            get_cover(
                &self.inner.index,
                range,
                millis(role_age),
                unix_millis(),
            )
        };
        match cover {
            Ok(peers) if !aborted() => peers,
            Ok(_) => Vec::new(),
            Err(e) => {
                warn!(error = %e, "coverage query failed");
                Vec::new()
            }
        }
    }

    /// The replicators responsible for `entry`, in selection order.
    pub fn find_leaders(&self, entry: &Entry, replicas: Option<usize>) -> Result<Vec<PeerId>> {
        let coordinate = self.inner.domain.from_entry(entry);
        self.inner
            .leaders(coordinate, replicas.unwrap_or(self.inner.replicas))
    }

    /// Whether the local peer is among the replicators responsible for `entry`.
    pub fn is_leader(&self, entry: &Entry, replicas: Option<usize>) -> Result<bool> {
        Ok(self
            .find_leaders(entry, replicas)?
            .contains(&self.inner.peer))
    }

    /// Wait until some other peer replicates with at least the requested
    /// role age.
    pub async fn wait_for_replicators(&self, options: WaitOptions) -> Result<()> {
        let role_age = options.role_age.unwrap_or(self.inner.role_maturity);
        let wait = self.wait_ready(role_age, options.signal.as_ref());
        match options.timeout {
            Some(timeout) => tokio::time::timeout(timeout, wait)
                .await
                .map_err(|_| SyncError::Timeout(timeout))?,
            None => wait.await,
        }
    }

    async fn wait_ready(
        &self,
        role_age: Duration,
        signal: Option<&CancellationToken>,
    ) -> Result<()> {
        loop {
            let notified = self.inner.changed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let next = match self.inner.replicator_ready(role_age)? {
                None => return Ok(()),
                Some(next) => next.min(WAIT_POLL),
            };
            tokio::select! {
                _ = &mut notified => {}
                _ = tokio::time::sleep(next) => {}
                _ = cancelled(signal) => return Err(SyncError::Aborted),
            }
        }
    }

    /// Number of armed maturity timers.
    pub fn pending_maturity(&self) -> usize {
        self.inner.lock_state().membership.pending()
    }

    /// Number of outstanding sync requests.
    pub fn in_flight(&self) -> usize {
        self.inner.lock_state().in_flight.len()
    }

    pub fn is_closed(&self) -> bool {
        self.inner.lock_state().closed
    }

    /// Stop background tasks and close the log. Idempotent.
    pub async fn close(&self) {
        let inner = &self.inner;
        {
            let mut state = inner.lock_state();
            if state.closed {
                return;
            }
            state.closed = true;
            state.membership.shutdown();
            state.in_flight.clear();
        }
        inner.cancel.cancel();
        inner.changed.notify_waiters();
        inner.log.lock().await.close();

        let tasks: Vec<JoinHandle<()>> =
            std::mem::take(&mut *inner.tasks.lock().expect("task lock poisoned"));
        for task in tasks {
            let _ = task.await;
        }
        info!(peer = %inner.peer, "shared log closed");
    }

    /// Close, then delete every entry and every local segment.
    pub async fn drop_all(&self) -> Result<()> {
        self.close().await;
        self.inner.index.del_owner(&self.inner.peer)?;
        self.inner.index_changed();
        self.inner.log.lock().await.drop_all().await?;
        Ok(())
    }
}

impl std::fmt::Debug for SharedLog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedLog")
            .field("peer", &self.inner.peer)
            .field("replicas", &self.inner.replicas)
            .finish_non_exhaustive()
    }
}

fn item_hash(item: &JoinItem) -> EntryHash {
    match item {
        JoinItem::Entry(e) => e.hash(),
        JoinItem::Hash(h) => *h,
        JoinItem::Shallow(s) => s.hash,
    }
}

fn millis(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}

async fn cancelled(signal: Option<&CancellationToken>) {
    match signal {
        Some(s) => s.cancelled().await,
        None => std::future::pending().await,
    }
}

async fn receive_loop(
    inner: Arc<Inner>,
    mut events: TransportEvents,
    mut matured: mpsc::UnboundedReceiver<(PeerId, SegmentId)>,
) {
    loop {
        tokio::select! {
            _ = inner.cancel.cancelled() => break,
            event = events.recv() => match event {
                Some(event) => {
                    if let Err(e) = inner.handle_event(event).await {
                        warn!(peer = %inner.peer, error = %e, "failed to handle transport event");
                    }
                }
                None => {
                    debug!(peer = %inner.peer, "transport closed");
                    break;
                }
            },
            Some((owner, segment)) = matured.recv() => {
                if let Err(e) = inner.on_mature(owner, segment).await {
                    warn!(peer = %inner.peer, error = %e, "failed to rebalance after maturity");
                }
            }
        }
    }
    debug!(peer = %inner.peer, "receive loop stopped");
}

impl Inner {
    fn lock_state(&self) -> MutexGuard<'_, SyncState> {
        self.state.lock().expect("sync state lock poisoned")
    }

    fn index_changed(&self) {
        self.index_version.fetch_add(1, Ordering::SeqCst);
        self.changed.notify_waiters();
    }

    /// Identifies the replication state trim verdicts are taken under: the
    /// index version and how many segments are mature right now.
    pub(crate) fn retention_epoch(&self) -> String {
        let version = self.index_version.load(Ordering::SeqCst);
        let query = SegmentQuery::all()
            .non_empty()
            .mature_at(unix_millis(), millis(self.role_maturity));
        let mature = self.read_index(|i| i.count(&query)).unwrap_or(0);
        format!("{version}.{mature}")
    }

    /// Whether dropping `entry` locally leaves it with a replicator.
    ///
    /// The local peer must not lead it, and when anyone leads it at least
    /// one leader must be mature. Entries nobody replicates are not held on
    /// anyone's behalf and may go.
    pub(crate) fn safe_to_trim(&self, entry: &Entry) -> bool {
        let segments = match self.read_index(|i| i.iterate(&SegmentQuery::all().non_empty())) {
            Ok(segments) => segments,
            Err(e) => {
                warn!(error = %e, "replication index unreadable, keeping entry");
                return false;
            }
        };
        let now = unix_millis();
        let role_ms = millis(self.role_maturity);
        let coordinate = self.domain.from_entry(entry);
        let leaders = select_from(&segments, coordinate, self.replicas, role_ms, now);
        if leaders.contains(&self.peer) {
            return false;
        }
        leaders.is_empty()
            || segments
                .iter()
                .any(|s| leaders.contains(&s.owner) && s.is_mature(now, role_ms))
    }

    /// Connected replicators, or every connected peer when none replicates.
    fn fetch_sources(&self) -> Result<Vec<PeerId>> {
        let connected: Vec<PeerId> = self
            .transport
            .peers()
            .into_iter()
            .filter(|p| *p != self.peer)
            .collect();
        let replicators = self.read_index(|i| i.owners(&SegmentQuery::all().non_empty()))?;
        let preferred: Vec<PeerId> = connected
            .iter()
            .filter(|p| replicators.contains(*p))
            .copied()
            .collect();
        Ok(if preferred.is_empty() {
            connected
        } else {
            preferred
        })
    }

    /// Resolves once every hash in `hashes` is in the log or the log closes.
    async fn wait_present(&self, hashes: &[EntryHash]) {
        loop {
            let notified = self.changed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let log = self.log.lock().await;
                if log.is_closed() || hashes.iter().all(|h| log.has(h)) {
                    return;
                }
            }
            tokio::select! {
                _ = &mut notified => {}
                _ = tokio::time::sleep(WAIT_POLL) => {}
                _ = self.cancel.cancelled() => return,
            }
        }
    }

    fn ensure_open(&self) -> Result<()> {
        if self.lock_state().closed {
            Err(SyncError::Closed)
        } else {
            Ok(())
        }
    }

    fn read_index<T>(
        &self,
        read: impl FnOnce(&ReplicationIndex) -> std::result::Result<T, ReplicationError>,
    ) -> Result<T> {
        let _state = self.lock_state();
        Ok(read(&self.index)?)
    }

    fn leaders(&self, coordinate: u32, replicas: usize) -> Result<Vec<PeerId>> {
        let segments = self.read_index(|i| i.iterate(&SegmentQuery::all().non_empty()))?;
        Ok(select_from(
            &segments,
            coordinate,
            replicas,
            millis(self.role_maturity),
            unix_millis(),
        ))
    }

    /// `None` when a mature replicator other than this peer exists,
    /// otherwise how long until the next one could mature.
    fn replicator_ready(&self, role_age: Duration) -> Result<Option<Duration>> {
        let state = self.lock_state();
        if state.closed {
            return Err(SyncError::Closed);
        }
        let now = unix_millis();
        let role_ms = millis(role_age);
        let mut next: Option<u64> = None;
        for segment in self.index.iterate(&SegmentQuery::all().non_empty())? {
            if segment.owner == self.peer {
                continue;
            }
            if segment.is_mature(now, role_ms) {
                return Ok(None);
            }
            let left = segment.created_at.saturating_add(role_ms).saturating_sub(now);
            next = Some(next.map_or(left, |n| n.min(left)));
        }
        Ok(Some(next.map_or(WAIT_POLL, Duration::from_millis)))
    }

    /// Queue `entries` for the remote replicators responsible for them.
    fn gossip(&self, entries: &[Entry]) -> Result<()> {
        if entries.is_empty() {
            return Ok(());
        }
        let segments = self.read_index(|i| i.iterate(&SegmentQuery::all().non_empty()))?;
        let now = unix_millis();
        let role_ms = millis(self.role_maturity);

        let mut per_peer: HashMap<PeerId, Vec<Head>> = HashMap::new();
        for entry in entries {
            let coordinate = self.domain.from_entry(entry);
            for leader in select_from(&segments, coordinate, self.replicas, role_ms, now) {
                if leader == self.peer {
                    continue;
                }
                per_peer
                    .entry(leader)
                    .or_default()
                    .push((entry.hash(), entry.to_block()?));
            }
        }
        for (peer, heads) in per_peer {
            debug!(%peer, count = heads.len(), "queueing heads");
            self.batcher.queue(peer, heads);
        }
        Ok(())
    }

    async fn send(&self, to: PeerId, message: SyncMessage) -> Result<()> {
        let bytes = message.encode()?;
        if bytes.len() > self.max_message_size {
            return Err(SyncError::MessageTooLarge {
                size: bytes.len(),
                max: self.max_message_size,
            });
        }
        self.transport.send(to, bytes).await
    }

    async fn broadcast(&self, message: SyncMessage) {
        let kind = message.kind();
        let result = match message.encode() {
            Ok(bytes) => self.transport.broadcast(bytes).await,
            Err(e) => Err(e),
        };
        if let Err(e) = result {
            error!(peer = %self.peer, kind, error = %e, "broadcast failed");
        }
    }

    async fn handle_event(&self, event: TransportEvent) -> Result<()> {
        match event {
            TransportEvent::PeerJoined(peer) => {
                debug!(local = %self.peer, %peer, "peer joined, requesting replication info");
                self.send(peer, SyncMessage::RequestReplicationInfo).await
            }
            TransportEvent::PeerLeft(peer) => {
                self.peer_left(peer);
                Ok(())
            }
            TransportEvent::Message { from, bytes } => {
                if bytes.len() > self.max_message_size {
                    warn!(%from, size = bytes.len(), "dropping oversized message");
                    return Ok(());
                }
                let message = match SyncMessage::decode(&bytes) {
                    Ok(m) => m,
                    Err(e) => {
                        warn!(%from, error = %e, "dropping malformed message");
                        return Ok(());
                    }
                };
                debug!(local = %self.peer, %from, kind = message.kind(), "received");
                self.handle_message(from, message).await
            }
        }
    }

    fn peer_left(&self, peer: PeerId) {
        let result = {
            let mut state = self.lock_state();
            state.in_flight.clear_peer(&peer);
            match self.index.del_owner(&peer) {
                Ok(removed) => {
                    state
                        .membership
                        .update(peer, &removed, &[], 0, unix_millis());
                    Ok(())
                }
                Err(e) => Err(e),
            }
        };
        if let Err(e) = result {
            warn!(%peer, error = %e, "failed to drop segments of departed peer");
        }
        self.index_changed();
    }

    async fn handle_message(&self, from: PeerId, message: SyncMessage) -> Result<()> {
        match message {
            SyncMessage::ExchangeHeads { heads } => self.on_heads(from, heads).await,
            SyncMessage::AddedReplicationSegments { segments } => {
                self.on_segments(from, segments, false).await
            }
            SyncMessage::AllReplicatingSegments { segments } => {
                self.on_segments(from, segments, true).await
            }
            SyncMessage::RequestReplicationInfo => {
                let segments = self.read_index(|i| i.by_owner(&self.peer))?;
                self.send(from, SyncMessage::AllReplicatingSegments { segments })
                    .await
            }
            SyncMessage::RequestMaybeSync { hashes } => {
                let missing: Vec<EntryHash> = {
                    let log = self.log.lock().await;
                    hashes.into_iter().filter(|h| !log.has(h)).collect()
                };
                let need = self.claim(from, missing.into_iter().map(Wanted::Hash));
                let hashes: Vec<EntryHash> = need
                    .into_iter()
                    .filter_map(|w| match w {
                        Wanted::Hash(h) => Some(h),
                        Wanted::Number(_) => None,
                    })
                    .collect();
                if hashes.is_empty() {
                    return Ok(());
                }
                self.send(from, SyncMessage::ResponseMaybeSync { hashes })
                    .await
            }
            SyncMessage::ResponseMaybeSync { hashes } => {
                let heads = {
                    let log = self.log.lock().await;
                    let present: Vec<EntryHash> =
                        hashes.into_iter().filter(|h| log.has(h)).collect();
                    encode_all(&log.ancestry(&present, &HashSet::new()))?
                };
                self.batcher.queue(from, heads);
                Ok(())
            }
            SyncMessage::RequestMaybeSyncCoordinate { numbers } => {
                let missing: Vec<u64> = {
                    let log = self.log.lock().await;
                    let have: HashSet<u64> = log.values().iter().map(|e| e.hash().number()).collect();
                    numbers.into_iter().filter(|n| !have.contains(n)).collect()
                };
                let need = self.claim(from, missing.into_iter().map(Wanted::Number));
                let numbers: Vec<u64> = need
                    .into_iter()
                    .filter_map(|w| match w {
                        Wanted::Number(n) => Some(n),
                        Wanted::Hash(_) => None,
                    })
                    .collect();
                if numbers.is_empty() {
                    return Ok(());
                }
                self.send(from, SyncMessage::ResponseMaybeSyncCoordinate { numbers })
                    .await
            }
            SyncMessage::ResponseMaybeSyncCoordinate { numbers } => {
                let wanted: HashSet<u64> = numbers.into_iter().collect();
                let heads = {
                    let log = self.log.lock().await;
                    let present: Vec<EntryHash> = log
                        .values()
                        .iter()
                        .map(|e| e.hash())
                        .filter(|h| wanted.contains(&h.number()))
                        .collect();
                    encode_all(&log.ancestry(&present, &HashSet::new()))?
                };
                self.batcher.queue(from, heads);
                Ok(())
            }
        }
    }

    /// Keep the requests not already outstanding with another peer and
    /// record them as outstanding with `from`.
    fn claim(&self, from: PeerId, wanted: impl Iterator<Item = Wanted>) -> Vec<Wanted> {
        let now = Instant::now();
        let mut state = self.lock_state();
        state.in_flight.prune(now);
        let mut claimed = Vec::new();
        for w in wanted {
            if state.in_flight.pending_elsewhere(w, &from, now) {
                debug!(%from, "already requested from another peer");
                continue;
            }
            state.in_flight.record(from, w, now);
            claimed.push(w);
        }
        claimed
    }

    async fn on_heads(&self, from: PeerId, heads: Vec<Vec<u8>>) -> Result<()> {
        let mut items = Vec::with_capacity(heads.len());
        for block in &heads {
            match Entry::from_block(block) {
                Ok(entry) => items.push(JoinItem::Entry(entry)),
                Err(e) => warn!(%from, error = %e, "dropping undecodable head"),
            }
        }
        if items.is_empty() {
            return Ok(());
        }

        let result = {
            let mut log = self.log.lock().await;
            if log.is_closed() {
                return Ok(());
            }
            log.join(items, JoinOptions::default()).await?
        };
        for hash in &result.rejected {
            warn!(%from, %hash, "peer sent a rejected entry");
        }
        self.joined(Some(from), &result);

        if result.missing.is_empty() {
            return Ok(());
        }
        let need = self.claim(from, result.missing.iter().copied().map(Wanted::Hash));
        let hashes: Vec<EntryHash> = need
            .into_iter()
            .filter_map(|w| match w {
                Wanted::Hash(h) => Some(h),
                Wanted::Number(_) => None,
            })
            .collect();
        if hashes.is_empty() {
            return Ok(());
        }
        debug!(%from, count = hashes.len(), "requesting missing ancestors");
        self.send(from, SyncMessage::ResponseMaybeSync { hashes })
            .await
    }

    /// Settle bookkeeping after a join and announce the new entries.
    fn joined(&self, from: Option<PeerId>, result: &JoinResult) {
        if result.added.is_empty() {
            return;
        }
        let hashes: Vec<EntryHash> = result.added.iter().map(|e| e.hash()).collect();
        {
            let mut state = self.lock_state();
            for hash in &hashes {
                state.in_flight.resolve(hash);
            }
        }
        debug!(peer = %self.peer, count = hashes.len(), "joined entries");
        self.events.emit(EntriesJoined { hashes, from });
        self.changed.notify_waiters();
    }

    async fn on_segments(
        &self,
        from: PeerId,
        segments: Vec<ReplicationSegment>,
        replace: bool,
    ) -> Result<()> {
        let (segments, foreign): (Vec<_>, Vec<_>) =
            segments.into_iter().partition(|s| s.owner == from);
        if !foreign.is_empty() {
            warn!(%from, count = foreign.len(), "ignoring segments owned by another peer");
        }

        let now = unix_millis();
        let added = {
            let mut state = self.lock_state();
            if state.closed {
                return Ok(());
            }
            let mut removed = Vec::new();
            if replace {
                let keep: HashSet<SegmentId> = segments.iter().map(|s| s.id).collect();
                for old in self.index.by_owner(&from)? {
                    if !keep.contains(&old.id) {
                        self.index.del(&from, &old.id)?;
                        removed.push(old);
                    }
                }
            }
            let mut added = Vec::new();
            for segment in segments {
                let previous = self.index.put(&segment)?;
                if previous.as_ref() != Some(&segment) {
                    added.push(segment);
                }
            }
            let remaining = self.index.by_owner(&from)?.len();
            state
                .membership
                .update(from, &removed, &added, remaining, now);
            added
        };
        self.index_changed();

        if added.is_empty() {
            return Ok(());
        }
        self.rebalance(from, &added).await
    }

    async fn on_mature(&self, owner: PeerId, segment: SegmentId) -> Result<()> {
        self.index_changed();
        if owner == self.peer {
            return Ok(());
        }
        let Some(segment) = self.read_index(|i| i.get(&owner, &segment))? else {
            return Ok(());
        };
        self.rebalance(owner, std::slice::from_ref(&segment)).await
    }

    /// Offer `owner` every local entry inside `segments` it now leads.
    async fn rebalance(&self, owner: PeerId, segments: &[ReplicationSegment]) -> Result<()> {
        let snapshot = self.read_index(|i| i.iterate(&SegmentQuery::all().non_empty()))?;
        let now = unix_millis();
        let role_ms = millis(self.role_maturity);

        let offers: Vec<EntryHash> = {
            let log = self.log.lock().await;
            log.values()
                .into_iter()
                .filter(|entry| {
                    let coordinate = self.domain.from_entry(entry);
                    segments.iter().any(|s| s.contains(coordinate))
                        && select_from(&snapshot, coordinate, self.replicas, role_ms, now)
                            .contains(&owner)
                })
                .map(|entry| entry.hash())
                .collect()
        };
        if offers.is_empty() {
            return Ok(());
        }
        debug!(peer = %owner, count = offers.len(), "offering entries");
        let offer = if offers.len() > COORDINATE_OFFER_THRESHOLD {
            SyncMessage::RequestMaybeSyncCoordinate {
                numbers: offers.iter().map(|h| h.number()).collect(),
            }
        } else {
            SyncMessage::RequestMaybeSync { hashes: offers }
        };
        self.send(owner, offer).await
    }
}

fn encode_all(entries: &[Entry]) -> Result<Vec<Head>> {
    let mut heads = Vec::with_capacity(entries.len());
    for entry in entries {
        heads.push((entry.hash(), entry.to_block()?));
    }
    Ok(heads)
}
