//! The persistent queue proper.

use std::collections::VecDeque;
use std::path::Path;
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use bytes::Bytes;
use fxhash::FxHashMap;
use parking_lot::{Mutex, RwLock};
use tracing::{error, warn};

use spool_journal::{now_ms, Item, Journal, JournalError, Record};

use crate::registry::QueueRegistry;
use crate::settings::{QueueDefaults, QueueOptions, QueueSettings};
use crate::waiters::WaitQueue;

/// A durable, transactional FIFO queue.
///
/// One mutex guards all queue state; every public operation acquires it and
/// returns promptly. The only way a caller blocks is through the
/// `*_receive` operations, which wait on a [`WaitQueue`] signal outside the
/// lock.
///
/// Mutations are journaled before (adds) or together with (removes) the
/// in-memory change, so a crash at any point replays to a state the queue
/// actually passed through. When the working set exceeds
/// `max_memory_size`, the tail of the queue lives only in the journal and is
/// streamed back in through the read-behind cursor.
pub struct PersistentQueue {
    name: String,
    settings: QueueSettings,
    registry: RwLock<Option<Weak<dyn QueueRegistry>>>,
    state: Mutex<QueueState>,
}

struct QueueState {
    journal: Journal,
    /// Memory-resident prefix of the queue, head at the front.
    buffer: VecDeque<Item>,
    /// Logical item count, including items behind the read cursor.
    queue_length: usize,
    /// Logical byte count, same scope as `queue_length`.
    queue_size: u64,
    /// Bytes held by `buffer` only.
    memory_bytes: u64,
    /// Tentatively-removed items awaiting confirm or rollback, by xid.
    open_transactions: FxHashMap<u32, Item>,
    xid_counter: u32,
    total_items: u64,
    total_expired: u64,
    total_discarded: u64,
    total_flushed: u64,
    current_age_ms: u64,
    closed: bool,
    paused: bool,
    /// Set on the first journal failure; the queue then refuses all work.
    broken: bool,
    replaying: bool,
    waiters: WaitQueue,
}

impl PersistentQueue {
    /// Opens the queue named `name` under `dir`, replaying any existing
    /// journal into memory.
    ///
    /// `options` is applied before the replay, so settings like
    /// `max_memory_size` and `journal` shape recovery itself.
    ///
    /// # Errors
    ///
    /// Returns an error if the journal directory or file cannot be set up,
    /// or if replay hits an IO failure.
    pub fn new(
        dir: impl AsRef<Path>,
        name: &str,
        defaults: Arc<RwLock<QueueDefaults>>,
        options: &QueueOptions,
    ) -> Result<Self, JournalError> {
        let settings = QueueSettings::new(defaults);
        settings.configure(options);
        let journal = Journal::open(dir.as_ref(), name, settings.sync_journal.get())?;
        let queue = Self {
            name: name.to_string(),
            settings,
            registry: RwLock::new(None),
            state: Mutex::new(QueueState {
                journal,
                buffer: VecDeque::new(),
                queue_length: 0,
                queue_size: 0,
                memory_bytes: 0,
                open_transactions: FxHashMap::default(),
                xid_counter: 0,
                total_items: 0,
                total_expired: 0,
                total_discarded: 0,
                total_flushed: 0,
                current_age_ms: 0,
                closed: false,
                paused: false,
                broken: false,
                replaying: false,
                waiters: WaitQueue::new(),
            }),
        };
        if queue.settings.keep_journal.get() {
            queue.replay_journal()?;
        } else {
            queue.state.lock().journal.erase()?;
        }
        Ok(queue)
    }

    /// Queue name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Live settings for this queue.
    #[must_use]
    pub fn settings(&self) -> &QueueSettings {
        &self.settings
    }

    /// Points the queue at the registry used to resolve `move_expired_to`.
    pub fn set_registry(&self, registry: &Arc<dyn QueueRegistry>) {
        *self.registry.write() = Some(Arc::downgrade(registry));
    }

    /// Applies a partial reconfiguration. Changes take effect on the next
    /// operation; turning `journal` off erases the on-disk log.
    pub fn reconfigure(&self, options: &QueueOptions) {
        self.settings.configure(options);
        let mut state = self.state.lock();
        if let Some(sync) = options.sync_journal {
            state.journal.set_sync(sync);
        }
        if options.journal == Some(false) && self.drain_read_behind(&mut state) {
            let result = state.journal.erase();
            self.note_journal(&mut state, result);
        }
    }

    /// Enqueues `data` with an absolute expiry (`0` = never).
    ///
    /// Returns false when the queue is closed or out of service, the payload
    /// exceeds `max_item_size`, or the queue is full and
    /// `discard_old_when_full` is off. A true return means the item has been
    /// journaled (and synced, in sync mode) and is recoverable.
    pub fn add(&self, data: Bytes, expiry_ms: u64) -> bool {
        let mut state = self.state.lock();
        self.add_locked(&mut state, data, expiry_ms)
    }

    /// Returns the head item without removing it.
    pub fn peek(&self) -> Option<Item> {
        let mut state = self.state.lock();
        self.peek_locked(&mut state)
    }

    /// Dequeues the head item.
    ///
    /// With `transactional` set, the item is stamped with a fresh xid and
    /// parked in the open-transaction table until
    /// [`confirm_remove`](Self::confirm_remove) or
    /// [`unremove`](Self::unremove) settles it.
    pub fn remove(&self, transactional: bool) -> Option<Item> {
        let mut state = self.state.lock();
        self.remove_locked(&mut state, transactional)
    }

    /// Rolls back the open transaction `xid`: the item returns to the head
    /// of the queue, ahead of everything currently queued. Unknown xids are
    /// ignored.
    pub fn unremove(&self, xid: u32) {
        let mut state = self.state.lock();
        if state.closed || state.broken {
            return;
        }
        if self.settings.keep_journal.get() {
            let result = state.journal.unremove(xid);
            self.note_journal(&mut state, result);
        }
        if self.restore_open_transaction(&mut state, xid) {
            state.waiters.wake_one();
        }
    }

    /// Commits the open transaction `xid`, destroying the item. Unknown xids
    /// are ignored.
    pub fn confirm_remove(&self, xid: u32) {
        let mut state = self.state.lock();
        if state.closed || state.broken {
            return;
        }
        if self.settings.keep_journal.get() {
            let result = state.journal.confirm_remove(xid);
            self.note_journal(&mut state, result);
        }
        state.open_transactions.remove(&xid);
    }

    /// Dequeues the head item, blocking until one arrives or the absolute
    /// deadline (epoch milliseconds) passes. A deadline at or before now
    /// degenerates to a single non-blocking attempt.
    pub fn remove_receive(&self, deadline_ms: u64, transactional: bool) -> Option<Item> {
        self.operate_receive(deadline_ms, |queue, state| {
            queue.remove_locked(state, transactional)
        })
    }

    /// Like [`remove_receive`](Self::remove_receive) but only peeks.
    pub fn peek_receive(&self, deadline_ms: u64) -> Option<Item> {
        self.operate_receive(deadline_ms, Self::peek_locked)
    }

    /// Drops expired items off the head of the queue, republishing them to
    /// the `move_expired_to` queue when one is configured. Returns the
    /// number discarded.
    pub fn discard_expired(&self) -> usize {
        let mut state = self.state.lock();
        self.discard_expired_locked(&mut state)
    }

    /// Removes every item non-transactionally.
    pub fn flush(&self) {
        let mut state = self.state.lock();
        let mut flushed = 0;
        while self.remove_locked(&mut state, false).is_some() {
            flushed += 1;
        }
        state.total_flushed += flushed;
    }

    /// Closes the queue: reads return `None`, writes return false, and every
    /// blocked consumer is woken to observe the closure.
    pub fn close(&self) {
        let mut state = self.state.lock();
        state.closed = true;
        state.journal.close();
        state.waiters.wake_all();
    }

    /// Suspends reads. Blocked consumers are woken and observe the pause.
    pub fn pause_reads(&self) {
        let mut state = self.state.lock();
        state.paused = true;
        state.waiters.wake_all();
    }

    /// Resumes reads after [`pause_reads`](Self::pause_reads).
    pub fn resume_reads(&self) {
        self.state.lock().paused = false;
    }

    /// Erases the on-disk journal. The logical queue is untouched; with
    /// journaling still enabled, the next mutation starts a fresh log.
    pub fn destroy_journal(&self) {
        let mut state = self.state.lock();
        // Items behind the read cursor exist only in the file about to be
        // deleted; pull them into memory first.
        if !self.drain_read_behind(&mut state) {
            return;
        }
        if let Err(err) = state.journal.erase() {
            warn!(queue = %self.name, error = %err, "failed to erase journal");
        }
    }

    // observation

    /// Logical item count (memory plus journal-behind).
    #[must_use]
    pub fn length(&self) -> usize {
        self.state.lock().queue_length
    }

    /// Logical byte count (memory plus journal-behind).
    #[must_use]
    pub fn bytes(&self) -> u64 {
        self.state.lock().queue_size
    }

    /// Items successfully added over the journal's lifetime.
    #[must_use]
    pub fn total_items(&self) -> u64 {
        self.state.lock().total_items
    }

    /// Items dropped because they expired.
    #[must_use]
    pub fn total_expired(&self) -> u64 {
        self.state.lock().total_expired
    }

    /// Items dropped by `discard_old_when_full` admission.
    #[must_use]
    pub fn total_discarded(&self) -> u64 {
        self.state.lock().total_discarded
    }

    /// Items dropped by [`flush`](Self::flush).
    #[must_use]
    pub fn total_flushed(&self) -> u64 {
        self.state.lock().total_flushed
    }

    /// Age of the most recently dequeued item, milliseconds. Zero while the
    /// queue is empty.
    #[must_use]
    pub fn current_age_ms(&self) -> u64 {
        let state = self.state.lock();
        if state.queue_length == 0 {
            0
        } else {
            state.current_age_ms
        }
    }

    /// Number of consumers blocked in a `*_receive` call.
    #[must_use]
    pub fn waiter_count(&self) -> usize {
        self.state.lock().waiters.len()
    }

    /// Number of unsettled transactional removes.
    #[must_use]
    pub fn open_transaction_count(&self) -> usize {
        self.state.lock().open_transactions.len()
    }

    /// Items currently resident in memory.
    #[must_use]
    pub fn memory_length(&self) -> usize {
        self.state.lock().buffer.len()
    }

    /// Bytes currently resident in memory.
    #[must_use]
    pub fn memory_bytes(&self) -> u64 {
        self.state.lock().memory_bytes
    }

    /// Current journal file length in bytes.
    #[must_use]
    pub fn journal_size(&self) -> u64 {
        self.state.lock().journal.size()
    }

    /// True while part of the queue lives only in the journal.
    #[must_use]
    pub fn in_read_behind(&self) -> bool {
        self.state.lock().journal.in_read_behind()
    }

    /// True once [`close`](Self::close) has been called.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    /// True while reads are paused.
    #[must_use]
    pub fn is_paused(&self) -> bool {
        self.state.lock().paused
    }

    // internals, all under the queue lock

    fn add_locked(&self, state: &mut QueueState, data: Bytes, expiry_ms: u64) -> bool {
        if state.closed || state.broken {
            return false;
        }
        if data.len() as u64 > self.settings.max_item_size.get() {
            return false;
        }
        let keep_journal = self.settings.keep_journal.get();
        let max_items = self.settings.max_items.get();
        let max_size = self.settings.max_size.get();
        while state.queue_length >= max_items || state.queue_size >= max_size {
            if !self.settings.discard_old_when_full.get() {
                return false;
            }
            if self.dequeue_head(state, false, None).is_none() {
                return false;
            }
            state.total_discarded += 1;
            if keep_journal {
                let result = state.journal.remove();
                if !self.note_journal(state, result) {
                    return false;
                }
            }
            if state.broken {
                return false;
            }
        }

        let now = now_ms();
        let item = Item::new(
            now,
            Item::adjust_expiry(now, expiry_ms, self.settings.max_age_ms.get()),
            data,
        );

        if keep_journal && !state.journal.in_read_behind() {
            let journal_size = state.journal.size();
            let max_journal_size = self.settings.max_journal_size.get();
            let overflowed = journal_size
                > max_journal_size.saturating_mul(self.settings.max_journal_overflow.get())
                && state.queue_size < max_journal_size;
            if overflowed || journal_size > self.settings.max_journal_size_absolute.get() {
                let result = roll_journal(state);
                if !self.note_journal(state, result) {
                    return false;
                }
            }
            if state.queue_size >= self.settings.max_memory_size.get() {
                let position = state.journal.size();
                let result = state.journal.start_read_behind(position);
                if !self.note_journal(state, result) {
                    return false;
                }
            }
        }
        if keep_journal {
            let result = state.journal.add(&item);
            if !self.note_journal(state, result) {
                return false;
            }
        }
        self.enqueue(state, item);
        state.waiters.wake_one();
        true
    }

    fn peek_locked(&self, state: &mut QueueState) -> Option<Item> {
        if state.closed || state.paused || state.broken || state.queue_length == 0 {
            return None;
        }
        self.discard_expired_locked(state);
        if state.broken {
            return None;
        }
        self.ensure_head_resident(state);
        state.buffer.front().cloned()
    }

    fn remove_locked(&self, state: &mut QueueState, transactional: bool) -> Option<Item> {
        if state.closed || state.paused || state.broken || state.queue_length == 0 {
            return None;
        }
        self.discard_expired_locked(state);
        if state.broken || state.queue_length == 0 {
            return None;
        }
        let item = self.dequeue_head(state, transactional, None)?;
        if self.settings.keep_journal.get() && !state.broken {
            let result = if transactional {
                state.journal.remove_tentative(item.xid)
            } else {
                state.journal.remove()
            };
            self.note_journal(state, result);
            if !transactional
                && !state.broken
                && state.queue_length == 0
                && !state.journal.in_read_behind()
                && state.journal.size() >= self.settings.max_journal_size.get()
            {
                let result = roll_journal(state);
                self.note_journal(state, result);
            }
        }
        Some(item)
    }

    fn operate_receive<F>(&self, deadline_ms: u64, op: F) -> Option<Item>
    where
        F: Fn(&Self, &mut QueueState) -> Option<Item>,
    {
        loop {
            let waiter = {
                let mut state = self.state.lock();
                if let Some(item) = op(self, &mut *state) {
                    return Some(item);
                }
                if state.closed || state.paused || state.broken {
                    return None;
                }
                if deadline_ms <= now_ms() {
                    return None;
                }
                state.waiters.enrol()
            };

            let remaining = Duration::from_millis(deadline_ms.saturating_sub(now_ms()));
            let signaled = waiter.wait_until(Instant::now() + remaining);

            let mut state = self.state.lock();
            state.waiters.cancel(&waiter);
            if !signaled {
                // A producer may have signaled between the timeout firing and
                // this lock acquisition; one last attempt closes that window.
                return op(self, &mut *state);
            }
        }
    }

    fn discard_expired_locked(&self, state: &mut QueueState) -> usize {
        if state.replaying {
            return 0;
        }
        let keep_journal = self.settings.keep_journal.get();
        let mut discarded = 0;
        loop {
            if state.broken {
                break;
            }
            self.ensure_head_resident(state);
            let now = now_ms();
            if !state
                .buffer
                .front()
                .is_some_and(|head| head.is_expired(now))
            {
                break;
            }
            let Some(item) = self.dequeue_head(state, false, None) else {
                break;
            };
            state.total_expired += 1;
            discarded += 1;
            if keep_journal && !state.broken {
                let result = state.journal.remove();
                if !self.note_journal(state, result) {
                    break;
                }
            }
            self.republish_expired(item);
        }
        discarded
    }

    /// Hands an expired item to the configured destination queue, with its
    /// expiry cleared. The registry is re-resolved on every call.
    fn republish_expired(&self, item: Item) {
        let Some(target_name) = self.settings.move_expired_to.get() else {
            return;
        };
        if target_name == self.name {
            return;
        }
        let registry = self.registry.read().as_ref().and_then(Weak::upgrade);
        let Some(registry) = registry else {
            return;
        };
        if let Some(target) = registry.queue_by_name(&target_name) {
            target.add(item.data, 0);
        }
    }

    fn enqueue(&self, state: &mut QueueState, item: Item) {
        let size = item.size();
        if !state.journal.in_read_behind() {
            state.memory_bytes += size;
            state.buffer.push_back(item);
        }
        state.queue_length += 1;
        state.queue_size += size;
        state.total_items += 1;
    }

    fn dequeue_head(
        &self,
        state: &mut QueueState,
        transactional: bool,
        xid: Option<u32>,
    ) -> Option<Item> {
        self.ensure_head_resident(state);
        let mut item = state.buffer.pop_front()?;
        let size = item.size();
        state.queue_length -= 1;
        state.queue_size -= size;
        state.memory_bytes -= size;
        self.refill_from_journal(state);
        if !state.replaying {
            state.current_age_ms = now_ms().saturating_sub(item.add_time);
        }
        if transactional {
            let xid = xid.unwrap_or_else(|| next_xid(state));
            item.xid = xid;
            state.open_transactions.insert(xid, item.clone());
        }
        Some(item)
    }

    fn restore_open_transaction(&self, state: &mut QueueState, xid: u32) -> bool {
        let Some(mut item) = state.open_transactions.remove(&xid) else {
            return false;
        };
        item.xid = 0;
        let size = item.size();
        state.queue_length += 1;
        state.queue_size += size;
        state.memory_bytes += size;
        state.buffer.push_front(item);
        true
    }

    /// Streams one item in from the read cursor when the buffer is empty, so
    /// the logical head is always inspectable even under a memory budget
    /// smaller than a single item.
    fn ensure_head_resident(&self, state: &mut QueueState) {
        if !state.buffer.is_empty() || !state.journal.in_read_behind() {
            return;
        }
        match state.journal.fill_read_behind() {
            Ok(Some(item)) => {
                state.memory_bytes += item.size();
                state.buffer.push_back(item);
            }
            Ok(None) => {}
            Err(err) => {
                self.note_journal(state, Err(err));
            }
        }
    }

    /// Streams every item still behind the read cursor into memory,
    /// regardless of the memory budget. Required before erasing the journal
    /// file those items live in. Returns false if the cursor hit an IO
    /// failure and the queue went out of service.
    fn drain_read_behind(&self, state: &mut QueueState) -> bool {
        while state.journal.in_read_behind() {
            match state.journal.fill_read_behind() {
                Ok(Some(item)) => {
                    state.memory_bytes += item.size();
                    state.buffer.push_back(item);
                }
                Ok(None) => break,
                Err(err) => {
                    self.note_journal(state, Err(err));
                    return false;
                }
            }
        }
        true
    }

    fn refill_from_journal(&self, state: &mut QueueState) {
        let max_memory = self.settings.max_memory_size.get();
        while state.journal.in_read_behind() && state.memory_bytes < max_memory {
            match state.journal.fill_read_behind() {
                Ok(Some(item)) => {
                    state.memory_bytes += item.size();
                    state.buffer.push_back(item);
                }
                Ok(None) => break,
                Err(err) => {
                    self.note_journal(state, Err(err));
                    break;
                }
            }
        }
    }

    fn replay_journal(&self) -> Result<(), JournalError> {
        let mut state = self.state.lock();
        let state = &mut *state;
        state.replaying = true;
        let max_memory = self.settings.max_memory_size.get();
        let mut replay = state.journal.replay()?;
        loop {
            match replay.next_record() {
                Ok(Some(record)) => {
                    self.apply_replayed(state, record, replay.record_start(), max_memory)?;
                }
                Ok(None) => break,
                Err(err) => {
                    warn!(
                        queue = %self.name,
                        error = %err,
                        "replay stopped at undecodable record; keeping the prefix"
                    );
                    break;
                }
            }
        }
        let valid_end = replay.valid_end();
        drop(replay);
        state.journal.finish_replay(valid_end)?;

        // Unconfirmed transactions roll back to the head, lowest xid first.
        let mut xids: Vec<u32> = state.open_transactions.keys().copied().collect();
        xids.sort_unstable();
        for xid in xids {
            state.journal.unremove(xid)?;
            self.restore_open_transaction(state, xid);
        }
        state.replaying = false;
        Ok(())
    }

    fn apply_replayed(
        &self,
        state: &mut QueueState,
        record: Record,
        record_start: u64,
        max_memory: u64,
    ) -> Result<(), JournalError> {
        match record {
            Record::Add { data } => {
                self.replay_add(state, 0, data, record_start, max_memory)?;
            }
            Record::AddX { expiry_ms, data } => {
                self.replay_add(state, expiry_ms, data, record_start, max_memory)?;
            }
            Record::Remove => {
                self.dequeue_head(state, false, None);
            }
            // The legacy form carries no xid; one is synthesized from the
            // counter, exactly as for a live tentative remove.
            Record::RemoveTentative => {
                self.dequeue_head(state, true, None);
            }
            Record::RemoveTentativeX(xid) => {
                self.dequeue_head(state, true, Some(xid));
            }
            Record::SavedXid(xid) => state.xid_counter = xid,
            Record::Unremove(xid) => {
                self.restore_open_transaction(state, xid);
            }
            Record::ConfirmRemove(xid) => {
                state.open_transactions.remove(&xid);
            }
        }
        Ok(())
    }

    fn replay_add(
        &self,
        state: &mut QueueState,
        expiry_ms: u64,
        data: Bytes,
        record_start: u64,
        max_memory: u64,
    ) -> Result<(), JournalError> {
        if !state.journal.in_read_behind() && state.queue_size >= max_memory {
            state.journal.start_read_behind(record_start)?;
        }
        self.enqueue(state, Item::new(now_ms(), expiry_ms, data));
        Ok(())
    }

    fn note_journal(&self, state: &mut QueueState, result: Result<(), JournalError>) -> bool {
        match result {
            Ok(()) => true,
            Err(err) => {
                if !state.broken {
                    error!(
                        queue = %self.name,
                        error = %err,
                        "journal failure; queue taken out of service"
                    );
                    state.broken = true;
                    state.waiters.wake_all();
                }
                false
            }
        }
    }
}

impl std::fmt::Debug for PersistentQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("PersistentQueue")
            .field("name", &self.name)
            .field("length", &state.queue_length)
            .field("bytes", &state.queue_size)
            .field("memory_bytes", &state.memory_bytes)
            .field("open_transactions", &state.open_transactions.len())
            .field("closed", &state.closed)
            .field("paused", &state.paused)
            .finish_non_exhaustive()
    }
}

fn next_xid(state: &mut QueueState) -> u32 {
    loop {
        state.xid_counter = state.xid_counter.wrapping_add(1);
        let xid = state.xid_counter;
        if xid != 0 && !state.open_transactions.contains_key(&xid) {
            return xid;
        }
    }
}

fn roll_journal(state: &mut QueueState) -> Result<(), JournalError> {
    let mut open: Vec<&Item> = state.open_transactions.values().collect();
    open.sort_unstable_by_key(|item| item.xid);
    state.journal.roll(state.xid_counter, open, &state.buffer)
}
