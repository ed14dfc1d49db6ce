mod error;
mod gating;
mod ledger;
mod mutations;
mod overrides;
mod pattern;
mod projection;
mod queries;
mod resolve;
mod validate;

pub use error::EngineError;
pub use gating::{gate, merged_pauses, plan_resume, DateSpan, Gate, Resumption};
pub use ledger::{additions_on, undated};
pub use overrides::{apply_overrides, Outcome};
pub use pattern::{evaluate_base, Base, ModeError};
pub use projection::{
    dates, month_bounds, CustomerRow, DayCell, DeliveryFilter, DeliveryList, MonthView, ProductTotal,
    ResolutionFailure,
};
pub use queries::ListItem;
pub use resolve::{paused_on, resolve, resolve_subscription};
pub use validate::today;

use std::io;
use std::ops::{Deref, DerefMut};
use std::path::PathBuf;
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{mpsc, oneshot, OwnedRwLockWriteGuard, RwLock, RwLockReadGuard};
use tracing::{debug, error, info};
use ulid::Ulid;

use crate::model::*;
use crate::notify::NotifyHub;
use crate::wal::Wal;

pub type SharedCustomerState = Arc<RwLock<CustomerState>>;

// ── Group-commit WAL channel ─────────────────────────────

pub(super) enum WalCommand {
    Append {
        event: Event,
        response: oneshot::Sender<io::Result<()>>,
    },
    Compact {
        events: Vec<Event>,
        response: oneshot::Sender<io::Result<()>>,
    },
    AppendsSinceCompact {
        response: oneshot::Sender<u64>,
    },
}

type PendingAppend = (Event, oneshot::Sender<io::Result<()>>);

/// Background task that owns the WAL. Appends that arrive while a flush is being
/// prepared share a single fsync.
async fn wal_writer_loop(mut wal: Wal, mut rx: mpsc::Receiver<WalCommand>) {
    while let Some(cmd) = rx.recv().await {
        let WalCommand::Append { event, response } = cmd else {
            handle_non_append(&mut wal, cmd);
            continue;
        };
        let mut batch = vec![(event, response)];
        let mut deferred = None;
        loop {
            match rx.try_recv() {
                Ok(WalCommand::Append { event, response }) => batch.push((event, response)),
                Ok(other) => {
                    deferred = Some(other);
                    break;
                }
                Err(_) => break,
            }
        }
        commit_batch(&mut wal, &mut batch);
        if let Some(cmd) = deferred {
            handle_non_append(&mut wal, cmd);
        }
    }
    debug!("WAL writer stopped");
}

fn commit_batch(wal: &mut Wal, batch: &mut Vec<PendingAppend>) {
    metrics::histogram!(crate::observability::WAL_FLUSH_BATCH_SIZE).record(batch.len() as f64);
    let flush_start = std::time::Instant::now();
    let result = flush_batch(wal, batch);
    metrics::histogram!(crate::observability::WAL_FLUSH_DURATION_SECONDS)
        .record(flush_start.elapsed().as_secs_f64());
    if let Err(e) = &result {
        error!("WAL flush failed for {} events: {e}", batch.len());
    }
    for (_, tx) in batch.drain(..) {
        let r = match &result {
            Ok(()) => Ok(()),
            Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
        };
        let _ = tx.send(r);
    }
}

fn flush_batch(wal: &mut Wal, batch: &[PendingAppend]) -> io::Result<()> {
    let appended = batch.iter().try_for_each(|(event, _)| wal.append_buffered(event));
    // Flush even after a failed append so half-written bytes never join the next batch.
    let flushed = wal.flush_sync();
    appended.and(flushed)
}

fn handle_non_append(wal: &mut Wal, cmd: WalCommand) {
    match cmd {
        WalCommand::Compact { events, response } => {
            let result = Wal::write_compact_file(wal.path(), &events).and_then(|()| wal.swap_compact_file());
            let _ = response.send(result);
        }
        WalCommand::AppendsSinceCompact { response } => {
            let _ = response.send(wal.appends_since_compact());
        }
        WalCommand::Append { event, response } => {
            let mut batch = vec![(event, response)];
            commit_batch(wal, &mut batch);
        }
    }
}

pub struct Engine {
    pub state: DashMap<Ulid, SharedCustomerState>,
    pub(super) wal_tx: mpsc::Sender<WalCommand>,
    pub notify: Arc<NotifyHub>,
    /// Reverse lookup: subscription / pause / addition id → customer id.
    pub(super) entity_to_customer: DashMap<Ulid, Ulid>,
    /// Subscriptions found in the log for customers that do not exist,
    /// keyed by the missing customer id.
    pub(super) orphans: DashMap<Ulid, Vec<Subscription>>,
    /// Mutations hold this shared from before their customer lock until applied;
    /// compaction holds it exclusively.
    pub(super) compaction_gate: RwLock<()>,
    clock: fn() -> Date,
}

/// A customer's write lock, taken while holding the compaction gate shared.
pub(super) struct CustomerWrite<'a> {
    guard: OwnedRwLockWriteGuard<CustomerState>,
    _gate: RwLockReadGuard<'a, ()>,
}

impl Deref for CustomerWrite<'_> {
    type Target = CustomerState;

    fn deref(&self) -> &CustomerState {
        &self.guard
    }
}

impl DerefMut for CustomerWrite<'_> {
    fn deref_mut(&mut self) -> &mut CustomerState {
        &mut self.guard
    }
}

/// Apply an event to one customer's state. The caller holds the lock.
/// Events that reference a subscription the customer does not own are ignored.
fn apply_to_customer(cs: &mut CustomerState, event: &Event, entity_map: &DashMap<Ulid, Ulid>) {
    let customer_id = cs.customer.id;
    match event {
        Event::CustomerUpserted { customer } => cs.customer = customer.clone(),
        Event::CustomerStatusChanged { status, .. } => cs.customer.status = *status,
        Event::SubscriptionCreated { subscription } => {
            entity_map.insert(subscription.id, customer_id);
            cs.subscriptions
                .insert(subscription.id, SubscriptionState::new(subscription.clone()));
        }
        Event::AdditionAdded { entry } => {
            entity_map.insert(entry.id, customer_id);
            cs.insert_addition(entry.clone());
        }
        Event::AdditionRemoved { id, .. } => {
            cs.remove_addition(*id);
            entity_map.remove(id);
        }
        other => {
            let Some(sub_id) = event_subscription_id(other) else { return };
            let Some(ss) = cs.subscriptions.get_mut(&sub_id) else {
                debug!(%sub_id, %customer_id, "event for unknown subscription ignored");
                return;
            };
            apply_to_subscription(ss, other, customer_id, entity_map);
        }
    }
}

fn apply_to_subscription(
    ss: &mut SubscriptionState,
    event: &Event,
    customer_id: Ulid,
    entity_map: &DashMap<Ulid, Ulid>,
) {
    match event {
        Event::SubscriptionStatusChanged { status, .. } => ss.subscription.status = *status,
        Event::ShiftChanged {
            shift, effective_from, ..
        } => ss.subscription.shift.set_from(*effective_from, *shift),
        Event::QuantityChanged {
            quantity,
            effective_from,
            ..
        } => ss.subscription.quantity.set_from(*effective_from, *quantity),
        Event::PauseSet { pause, .. } => {
            entity_map.insert(pause.id, customer_id);
            ss.upsert_pause(pause.clone());
        }
        Event::PauseCleared { id, .. } => {
            ss.remove_pause(*id);
            entity_map.remove(id);
        }
        Event::PausesResumed { resume_on, .. } => {
            let plan = plan_resume(&ss.pauses, *resume_on);
            for pause in plan.truncated {
                ss.upsert_pause(pause);
            }
            for id in plan.removed {
                ss.remove_pause(id);
                entity_map.remove(&id);
            }
        }
        Event::SubscriptionStopped { record, .. } => {
            ss.subscription.status = SubscriptionStatus::Stopped;
            ss.stop = Some(record.clone());
        }
        Event::OverrideSet { date_override } => {
            ss.overrides.insert(date_override.date, date_override.clone());
        }
        Event::OverrideCleared { date, .. } => {
            ss.overrides.remove(date);
        }
        _ => {}
    }
}

/// Subscription an event targets, for events below the customer level.
fn event_subscription_id(event: &Event) -> Option<Ulid> {
    match event {
        Event::SubscriptionStatusChanged { id, .. }
        | Event::ShiftChanged { id, .. }
        | Event::QuantityChanged { id, .. } => Some(*id),
        Event::PauseSet { pause, .. } => Some(pause.subscription_id),
        Event::PauseCleared { subscription_id, .. }
        | Event::PausesResumed { subscription_id, .. }
        | Event::OverrideCleared { subscription_id, .. } => Some(*subscription_id),
        Event::SubscriptionStopped { record, .. } => Some(record.subscription_id),
        Event::OverrideSet { date_override } => Some(date_override.subscription_id),
        Event::CustomerUpserted { .. }
        | Event::CustomerStatusChanged { .. }
        | Event::SubscriptionCreated { .. }
        | Event::AdditionAdded { .. }
        | Event::AdditionRemoved { .. } => None,
    }
}

impl Engine {
    pub fn new(wal_path: PathBuf, notify: Arc<NotifyHub>) -> io::Result<Self> {
        let (wal, events) = Wal::open(&wal_path)?;
        let (wal_tx, wal_rx) = mpsc::channel(4096);
        tokio::spawn(wal_writer_loop(wal, wal_rx));

        let engine = Self {
            state: DashMap::new(),
            wal_tx,
            notify,
            entity_to_customer: DashMap::new(),
            orphans: DashMap::new(),
            compaction_gate: RwLock::new(()),
            clock: today,
        };

        // Sole owner of every Arc during replay, so try_write always succeeds.
        // Never block here: this can run inside an async context (lazy tenant creation).
        for event in &events {
            engine.replay_event(event);
        }
        if !events.is_empty() {
            info!(
                "replayed {} events into {} customers from {}",
                events.len(),
                engine.state.len(),
                wal_path.display()
            );
        }
        Ok(engine)
    }

    /// Replace the source of "today". Permanent changes are checked against it.
    pub fn with_clock(mut self, clock: fn() -> Date) -> Self {
        self.clock = clock;
        self
    }

    pub fn today(&self) -> Date {
        (self.clock)()
    }

    fn replay_event(&self, event: &Event) {
        let customer_id = event.customer_id();
        if let Event::CustomerUpserted { customer } = event
            && !self.state.contains_key(&customer.id)
        {
            self.state
                .insert(customer.id, Arc::new(RwLock::new(CustomerState::new(customer.clone()))));
            return;
        }
        let Some(entry) = self.state.get(&customer_id) else {
            if let Event::SubscriptionCreated { subscription } = event {
                error!(
                    subscription_id = %subscription.id,
                    %customer_id,
                    "replay: subscription for a customer that does not exist"
                );
                self.orphans.entry(customer_id).or_default().push(subscription.clone());
            } else {
                debug!(%customer_id, "replay: event for unknown customer skipped");
            }
            return;
        };
        let cs = entry.value().clone();
        drop(entry);
        match cs.try_write() {
            Ok(mut guard) => apply_to_customer(&mut guard, event, &self.entity_to_customer),
            Err(_) => error!(%customer_id, "replay: customer state unexpectedly locked"),
        }
    }

    /// Write event to WAL via the background group-commit writer.
    async fn wal_append(&self, event: &Event) -> Result<(), EngineError> {
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Append {
                event: event.clone(),
                response: tx,
            })
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()))
    }

    pub fn get_customer(&self, id: &Ulid) -> Option<SharedCustomerState> {
        self.state.get(id).map(|e| e.value().clone())
    }

    pub fn get_customer_for_entity(&self, entity_id: &Ulid) -> Option<Ulid> {
        self.entity_to_customer.get(entity_id).map(|e| *e.value())
    }

    /// The error for a customer id that has no state: an integrity failure if the log
    /// holds subscriptions claiming it, otherwise plain not-found.
    pub(super) fn missing_customer(&self, customer_id: Ulid) -> EngineError {
        match self.orphans.get(&customer_id).and_then(|subs| subs.first().map(|s| s.id)) {
            Some(subscription_id) => {
                metrics::counter!(crate::observability::INTEGRITY_ERRORS_TOTAL).increment(1);
                EngineError::Integrity {
                    subscription_id,
                    customer_id,
                }
            }
            None => EngineError::NotFound(customer_id),
        }
    }

    /// WAL-append + apply + notify in one call.
    pub(super) async fn persist_and_apply(&self, cs: &mut CustomerState, event: &Event) -> Result<(), EngineError> {
        self.wal_append(event).await?;
        apply_to_customer(cs, event, &self.entity_to_customer);
        self.notify.send(cs.customer.id, event);
        Ok(())
    }

    /// Customer write lock for an existing customer.
    pub(super) async fn customer_write(&self, customer_id: Ulid) -> Result<CustomerWrite<'_>, EngineError> {
        let gate = self.compaction_gate.read().await;
        let cs = self
            .get_customer(&customer_id)
            .ok_or_else(|| self.missing_customer(customer_id))?;
        Ok(CustomerWrite {
            guard: cs.write_owned().await,
            _gate: gate,
        })
    }

    /// Lookup entity → customer, get customer, acquire write lock.
    pub(super) async fn resolve_entity_write(
        &self,
        entity_id: &Ulid,
    ) -> Result<CustomerWrite<'_>, EngineError> {
        let customer_id = self
            .get_customer_for_entity(entity_id)
            .ok_or(EngineError::NotFound(*entity_id))?;
        self.customer_write(customer_id).await
    }
}
