//! Optimistic action ledger.
//!
//! Every dispatched mutation is recorded here before its backend call starts,
//! together with an in-flight count per target thread. Readers fold the live
//! entries over the cached thread to get what the user should see. The whole
//! state is one immutable snapshot swapped under a lock, so inserting an entry
//! and bumping its counts is a single step for any reader.

use parking_lot::RwLock;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;
use tracing::debug;
use uuid::Uuid;

use crate::error::{MailError, MailResult};
use crate::events::EventBus;
use crate::model::{AccountId, Folder, LabelId, Thread, ThreadId, system_labels};

pub type ActionId = Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ActionKind {
    Move,
    Star,
    Read,
    Label,
    Important,
}

impl fmt::Display for ActionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ActionKind::Move => "move",
            ActionKind::Star => "star",
            ActionKind::Read => "read",
            ActionKind::Label => "label",
            ActionKind::Important => "important",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ActionPayload {
    /// `None` returns the thread to the inbox
    Move(Option<Folder>),
    Star(bool),
    Read(bool),
    Important(bool),
    Label {
        add: Vec<LabelId>,
        remove: Vec<LabelId>,
    },
}

impl ActionPayload {
    pub fn kind(&self) -> ActionKind {
        match self {
            ActionPayload::Move(_) => ActionKind::Move,
            ActionPayload::Star(_) => ActionKind::Star,
            ActionPayload::Read(_) => ActionKind::Read,
            ActionPayload::Important(_) => ActionKind::Important,
            ActionPayload::Label { .. } => ActionKind::Label,
        }
    }

    fn validate(&self) -> MailResult<()> {
        match self {
            ActionPayload::Move(Some(folder)) if !folder.is_move_target() => Err(
                MailError::ValidationError(format!("cannot move threads to {folder}")),
            ),
            ActionPayload::Label { add, remove } => {
                if add.is_empty() && remove.is_empty() {
                    return Err(MailError::ValidationError(
                        "label change adds and removes nothing".to_string(),
                    ));
                }
                for label in add.iter().chain(remove) {
                    if label.trim().is_empty() {
                        return Err(MailError::ValidationError("empty label id".to_string()));
                    }
                    if system_labels::is_structural(label) {
                        return Err(MailError::ValidationError(format!(
                            "'{label}' is changed by move, star, read or important actions"
                        )));
                    }
                }
                match add.iter().find(|l| remove.contains(l)) {
                    Some(label) => Err(MailError::ValidationError(format!(
                        "label '{label}' is both added and removed"
                    ))),
                    None => Ok(()),
                }
            }
            _ => Ok(()),
        }
    }

    fn apply(&self, thread: &mut Thread) {
        match self {
            ActionPayload::Move(destination) => {
                thread.folder = destination.unwrap_or(Folder::Inbox);
            }
            ActionPayload::Star(starred) => thread.starred = *starred,
            ActionPayload::Read(read) => thread.set_read(*read),
            ActionPayload::Important(important) => thread.important = *important,
            ActionPayload::Label { add, remove } => {
                for label in add {
                    thread.add_label(label);
                }
                for label in remove {
                    thread.remove_label(label);
                }
            }
        }
    }
}

/// A user mutation before it is recorded
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Mutation {
    pub targets: Vec<ThreadId>,
    pub payload: ActionPayload,
}

fn ids<I, S>(targets: I) -> Vec<ThreadId>
where
    I: IntoIterator<Item = S>,
    S: Into<ThreadId>,
{
    targets.into_iter().map(Into::into).collect()
}

impl Mutation {
    pub fn move_to<I, S>(targets: I, destination: Option<Folder>) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<ThreadId>,
    {
        Self {
            targets: ids(targets),
            payload: ActionPayload::Move(destination),
        }
    }

    pub fn star<I, S>(targets: I, starred: bool) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<ThreadId>,
    {
        Self {
            targets: ids(targets),
            payload: ActionPayload::Star(starred),
        }
    }

    pub fn read<I, S>(targets: I, read: bool) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<ThreadId>,
    {
        Self {
            targets: ids(targets),
            payload: ActionPayload::Read(read),
        }
    }

    pub fn important<I, S>(targets: I, important: bool) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<ThreadId>,
    {
        Self {
            targets: ids(targets),
            payload: ActionPayload::Important(important),
        }
    }

    pub fn label<I, S>(targets: I, add: &[&str], remove: &[&str]) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<ThreadId>,
    {
        Self {
            targets: ids(targets),
            payload: ActionPayload::Label {
                add: add.iter().map(|l| l.to_string()).collect(),
                remove: remove.iter().map(|l| l.to_string()).collect(),
            },
        }
    }
}

/// A recorded mutation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OptimisticAction {
    pub id: ActionId,
    pub account: AccountId,
    /// Threads this entry still speaks for; newer same-kind entries take threads away
    pub targets: Vec<ThreadId>,
    pub payload: ActionPayload,
    /// Creation order across the ledger
    pub seq: u64,
}

impl OptimisticAction {
    pub fn kind(&self) -> ActionKind {
        self.payload.kind()
    }

    fn targets(&self, thread: &str) -> bool {
        self.targets.iter().any(|t| t == thread)
    }

    /// Applies just this action's change to `thread`
    pub fn apply_to(&self, thread: &mut Thread) {
        self.payload.apply(thread);
    }
}

/// Immutable view of the ledger and in-flight counts
#[derive(Debug, Clone, Default)]
pub struct LedgerSnapshot {
    next_seq: u64,
    entries: BTreeMap<u64, OptimisticAction>,
    by_id: HashMap<ActionId, u64>,
    /// Every dispatched action still awaiting settlement, with its original targets
    pending: HashMap<ActionId, Vec<ThreadId>>,
    in_flight: HashMap<ThreadId, usize>,
}

impl LedgerSnapshot {
    /// Number of live ledger entries
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains(&self, id: &ActionId) -> bool {
        self.by_id.contains_key(id)
    }

    pub fn get(&self, id: &ActionId) -> Option<&OptimisticAction> {
        self.by_id.get(id).and_then(|seq| self.entries.get(seq))
    }

    /// Whether the action has been dispatched but not yet settled or rolled back
    pub fn is_pending(&self, id: &ActionId) -> bool {
        self.pending.contains_key(id)
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    pub fn in_flight(&self, thread: &str) -> usize {
        self.in_flight.get(thread).copied().unwrap_or(0)
    }

    /// Entries recorded for `account`; `None` reads every account's entries
    pub fn for_account<'a>(&'a self, account: Option<&'a str>) -> AccountLedger<'a> {
        AccountLedger {
            ledger: self,
            account,
        }
    }

    /// Live entries touching `thread`, in creation order
    pub fn entries_for<'a>(&'a self, thread: &'a str) -> impl Iterator<Item = &'a OptimisticAction> {
        self.entries.values().filter(move |a| a.targets(thread))
    }

    pub fn is_hidden(&self, thread: &str) -> bool {
        self.for_account(None).is_hidden(thread)
    }

    pub fn effective(&self, base: &Thread) -> Thread {
        self.for_account(None).effective(base)
    }

    pub fn visible(&self, base: &Thread) -> Option<Thread> {
        self.for_account(None).visible(base)
    }

    fn insert(&mut self, account: AccountId, targets: Vec<ThreadId>, payload: ActionPayload) -> OptimisticAction {
        let kind = payload.kind();

        // Label deltas accumulate; every other kind keeps only the newest value per thread
        if kind != ActionKind::Label {
            let mut emptied = Vec::new();
            for (seq, entry) in self.entries.iter_mut() {
                if entry.kind() == kind && entry.account == account {
                    entry.targets.retain(|t| !targets.contains(t));
                    if entry.targets.is_empty() {
                        emptied.push((*seq, entry.id));
                    }
                }
            }
            for (seq, id) in emptied {
                debug!("ledger: {} action {} superseded", kind, id);
                self.entries.remove(&seq);
                self.by_id.remove(&id);
            }
        }

        let seq = self.next_seq;
        self.next_seq += 1;
        let action = OptimisticAction {
            id: Uuid::new_v4(),
            account,
            targets: targets.clone(),
            payload,
            seq,
        };

        for thread in &targets {
            *self.in_flight.entry(thread.clone()).or_default() += 1;
        }
        self.pending.insert(action.id, targets);
        self.by_id.insert(action.id, seq);
        self.entries.insert(seq, action.clone());
        action
    }

    fn finish(&mut self, id: &ActionId) -> Vec<ThreadId> {
        if let Some(seq) = self.by_id.remove(id) {
            self.entries.remove(&seq);
        }

        let targets = self.pending.remove(id).unwrap_or_default();
        for thread in &targets {
            if let Some(count) = self.in_flight.get_mut(thread) {
                *count -= 1;
                if *count == 0 {
                    self.in_flight.remove(thread);
                }
            }
        }
        targets
    }
}

/// The ledger as seen over one account's cached threads.
///
/// Thread ids are only unique within an account, so entries dispatched on
/// another account never apply here.
#[derive(Clone, Copy)]
pub struct AccountLedger<'a> {
    ledger: &'a LedgerSnapshot,
    account: Option<&'a str>,
}

impl<'a> AccountLedger<'a> {
    /// Live entries touching `thread`, in creation order
    pub fn entries_for(self, thread: &'a str) -> impl Iterator<Item = &'a OptimisticAction> {
        let account = self.account;
        self.ledger
            .entries_for(thread)
            .filter(move |a| account.is_none_or(|id| a.account == id))
    }

    /// A thread with a pending move is shown in no list until it settles
    pub fn is_hidden(self, thread: &str) -> bool {
        let account = self.account;
        self.ledger
            .entries_for(thread)
            .filter(|a| account.is_none_or(|id| a.account == id))
            .any(|a| a.kind() == ActionKind::Move)
    }

    /// `base` with every live entry for it applied in creation order
    pub fn effective(self, base: &Thread) -> Thread {
        let account = self.account;
        let mut thread = base.clone();
        for action in self
            .ledger
            .entries_for(&base.id)
            .filter(|a| account.is_none_or(|id| a.account == id))
        {
            action.payload.apply(&mut thread);
        }
        thread
    }

    /// Effective thread for list views, or `None` while hidden by a move
    pub fn visible(self, base: &Thread) -> Option<Thread> {
        (!self.is_hidden(&base.id)).then(|| self.effective(base))
    }
}

/// Shared, injectable ledger store
pub struct OptimisticStore {
    state: RwLock<Arc<LedgerSnapshot>>,
    events: Arc<EventBus>,
}

impl OptimisticStore {
    pub fn new(events: Arc<EventBus>) -> Self {
        Self {
            state: RwLock::new(Arc::new(LedgerSnapshot::default())),
            events,
        }
    }

    pub fn snapshot(&self) -> Arc<LedgerSnapshot> {
        Arc::clone(&self.state.read())
    }

    fn update<R>(&self, f: impl FnOnce(&mut LedgerSnapshot) -> R) -> R {
        let mut guard = self.state.write();
        f(Arc::make_mut(&mut guard))
    }

    /// Records a mutation and marks its threads in flight, atomically
    pub fn begin(&self, account: AccountId, mutation: Mutation) -> MailResult<OptimisticAction> {
        mutation.payload.validate()?;

        let mut targets: Vec<ThreadId> = Vec::with_capacity(mutation.targets.len());
        for id in mutation.targets {
            let id = id.trim().to_string();
            if !id.is_empty() && !targets.contains(&id) {
                targets.push(id);
            }
        }
        if targets.is_empty() {
            return Err(MailError::ValidationError(
                "mutation has no target threads".to_string(),
            ));
        }

        let action = self.update(|state| state.insert(account, targets, mutation.payload));
        debug!(
            "ledger: {} action {} on {} thread(s)",
            action.kind(),
            action.id,
            action.targets.len()
        );
        self.events.threads_changed(&action.targets);
        Ok(action)
    }

    /// Threads the action still speaks for
    pub fn live_targets(&self, id: &ActionId) -> Vec<ThreadId> {
        self.snapshot()
            .get(id)
            .map(|a| a.targets.clone())
            .unwrap_or_default()
    }

    /// Removes a confirmed action; returns its original targets
    pub fn settle(&self, id: &ActionId) -> Vec<ThreadId> {
        let targets = self.update(|state| state.finish(id));
        debug!("ledger: action {} settled", id);
        self.events.threads_changed(&targets);
        targets
    }

    /// Removes a failed action so the cached state shows through again
    pub fn rollback(&self, id: &ActionId) -> Vec<ThreadId> {
        let targets = self.update(|state| state.finish(id));
        debug!("ledger: action {} rolled back", id);
        self.events.threads_changed(&targets);
        targets
    }
}
