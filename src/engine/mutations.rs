use std::sync::Arc;

use tokio::sync::{oneshot, RwLock};
use tracing::{info, warn};
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;

use super::gating::plan_resume;
use super::validate::*;
use super::{Engine, EngineError, WalCommand};

fn subscription(cs: &CustomerState, id: Ulid) -> Result<&SubscriptionState, EngineError> {
    cs.subscriptions.get(&id).ok_or(EngineError::NotFound(id))
}

impl Engine {
    // ── Registration ────────────────────────────────────────

    /// Create the customer or replace its profile. Subscriptions and ledger entries are kept.
    pub async fn upsert_customer(&self, customer: Customer) -> Result<(), EngineError> {
        validate_text(customer.name.as_deref(), MAX_NAME_LEN, "customer name too long")?;
        validate_text(customer.area.as_deref(), MAX_NAME_LEN, "area name too long")?;
        let event = Event::CustomerUpserted {
            customer: customer.clone(),
        };
        // Held until the new customer is in `state`, so compaction cannot snapshot
        // between the append and the insert.
        let _gate = self.compaction_gate.read().await;

        if let Some(cs) = self.get_customer(&customer.id) {
            let mut guard = cs.write().await;
            if guard.customer == customer {
                return Ok(());
            }
            return self.persist_and_apply(&mut guard, &event).await;
        }

        if self.state.len() >= MAX_CUSTOMERS_PER_TENANT {
            return Err(EngineError::LimitExceeded("too many customers"));
        }
        if self.entity_to_customer.contains_key(&customer.id) {
            return Err(EngineError::AlreadyExists(customer.id));
        }
        // Orphaned subscriptions must not be silently adopted by a new customer.
        if self.orphans.contains_key(&customer.id) {
            return Err(self.missing_customer(customer.id));
        }
        self.wal_append(&event).await?;
        let cs = self
            .state
            .entry(customer.id)
            .or_insert_with(|| Arc::new(RwLock::new(CustomerState::new(customer.clone()))))
            .value()
            .clone();
        cs.write().await.customer = customer.clone();
        self.notify.send(customer.id, &event);
        Ok(())
    }

    pub async fn set_customer_status(&self, id: Ulid, status: CustomerStatus) -> Result<(), EngineError> {
        let mut guard = self.customer_write(id).await?;
        if guard.customer.status == status {
            return Ok(());
        }
        let event = Event::CustomerStatusChanged { id, status };
        self.persist_and_apply(&mut guard, &event).await
    }

    pub async fn create_subscription(&self, sub: Subscription) -> Result<(), EngineError> {
        validate_subscription(&sub)?;
        let mut guard = self.customer_write(sub.customer_id).await?;
        if let Some(existing) = guard.subscriptions.get(&sub.id) {
            return if existing.subscription == sub {
                Ok(())
            } else {
                Err(EngineError::AlreadyExists(sub.id))
            };
        }
        if self.entity_to_customer.contains_key(&sub.id) || self.state.contains_key(&sub.id) {
            return Err(EngineError::AlreadyExists(sub.id));
        }
        if guard.subscriptions.len() >= MAX_SUBSCRIPTIONS_PER_CUSTOMER {
            return Err(EngineError::LimitExceeded("too many subscriptions on customer"));
        }
        let event = Event::SubscriptionCreated { subscription: sub };
        self.persist_and_apply(&mut guard, &event).await
    }

    pub async fn set_subscription_status(&self, id: Ulid, status: SubscriptionStatus) -> Result<Ulid, EngineError> {
        let mut guard = self.resolve_entity_write(&id).await?;
        let ss = subscription(&guard, id)?;
        let current = ss.subscription.status;
        check_transition(id, current, status)?;
        let customer_id = guard.customer.id;
        if current == status {
            return Ok(customer_id);
        }
        let event = Event::SubscriptionStatusChanged { id, customer_id, status };
        self.persist_and_apply(&mut guard, &event).await?;
        Ok(customer_id)
    }

    // ── Permanent default changes ───────────────────────────

    /// Change the default shift from `effective_from` onward. Earlier dates keep the
    /// shift that was in effect for them.
    pub async fn set_permanent_shift(&self, id: Ulid, shift: Shift, effective_from: Date) -> Result<Ulid, EngineError> {
        validate_effective_from(effective_from, self.today())?;
        let mut guard = self.resolve_entity_write(&id).await?;
        let ss = subscription(&guard, id)?;
        ensure_not_stopped_on(ss, effective_from)?;
        let customer_id = guard.customer.id;
        if !ss.subscription.shift.would_change(effective_from, shift) {
            return Ok(customer_id);
        }
        let event = Event::ShiftChanged {
            id,
            customer_id,
            shift,
            effective_from,
        };
        self.persist_and_apply(&mut guard, &event).await?;
        Ok(customer_id)
    }

    pub async fn set_permanent_quantity(
        &self,
        id: Ulid,
        quantity: Packets,
        effective_from: Date,
    ) -> Result<Ulid, EngineError> {
        validate_effective_from(effective_from, self.today())?;
        validate_quantity(quantity)?;
        let mut guard = self.resolve_entity_write(&id).await?;
        let ss = subscription(&guard, id)?;
        ensure_not_stopped_on(ss, effective_from)?;
        let customer_id = guard.customer.id;
        if !ss.subscription.quantity.would_change(effective_from, quantity) {
            return Ok(customer_id);
        }
        let event = Event::QuantityChanged {
            id,
            customer_id,
            quantity,
            effective_from,
        };
        self.persist_and_apply(&mut guard, &event).await?;
        Ok(customer_id)
    }

    // ── Pauses & stops ──────────────────────────────────────

    /// Insert or replace a pause by its id.
    pub async fn set_pause(&self, pause: PauseInterval) -> Result<Ulid, EngineError> {
        validate_pause(&pause)?;
        let mut guard = self.resolve_entity_write(&pause.subscription_id).await?;
        let ss = subscription(&guard, pause.subscription_id)?;
        ensure_not_stopped_on(ss, pause.start)?;
        let customer_id = guard.customer.id;
        match ss.pauses.iter().find(|p| p.id == pause.id) {
            Some(existing) if *existing == pause => return Ok(customer_id),
            Some(_) => {}
            None => {
                // The id is taken by something other than a pause of this subscription.
                if self.entity_to_customer.contains_key(&pause.id) {
                    return Err(EngineError::AlreadyExists(pause.id));
                }
                if ss.pauses.len() >= MAX_PAUSES_PER_SUBSCRIPTION {
                    return Err(EngineError::LimitExceeded("too many pauses on subscription"));
                }
            }
        }
        let event = Event::PauseSet { customer_id, pause };
        self.persist_and_apply(&mut guard, &event).await?;
        Ok(customer_id)
    }

    pub async fn clear_pause(&self, id: Ulid) -> Result<Ulid, EngineError> {
        let mut guard = self.resolve_entity_write(&id).await?;
        let subscription_id = guard
            .subscriptions
            .values()
            .find(|ss| ss.pauses.iter().any(|p| p.id == id))
            .map(|ss| ss.subscription.id)
            .ok_or(EngineError::NotFound(id))?;
        let customer_id = guard.customer.id;
        let event = Event::PauseCleared {
            id,
            subscription_id,
            customer_id,
        };
        self.persist_and_apply(&mut guard, &event).await?;
        Ok(customer_id)
    }

    /// Deliveries restart on `resume_on`: pauses covering it end the day before.
    /// A no-op when nothing is paused on that date.
    pub async fn resume(&self, subscription_id: Ulid, resume_on: Date) -> Result<Ulid, EngineError> {
        validate_date(resume_on)?;
        let mut guard = self.resolve_entity_write(&subscription_id).await?;
        let ss = subscription(&guard, subscription_id)?;
        ensure_not_stopped_on(ss, resume_on)?;
        let customer_id = guard.customer.id;
        if plan_resume(&ss.pauses, resume_on).is_empty() {
            return Ok(customer_id);
        }
        let event = Event::PausesResumed {
            subscription_id,
            customer_id,
            resume_on,
        };
        self.persist_and_apply(&mut guard, &event).await?;
        Ok(customer_id)
    }

    /// Terminal. Repeating a stop with the same date is a no-op; a different date conflicts.
    pub async fn stop(&self, subscription_id: Ulid, reason: Option<String>, stopped_at: Date) -> Result<Ulid, EngineError> {
        validate_date(stopped_at)?;
        validate_text(reason.as_deref(), MAX_REASON_LEN, "stop reason too long")?;
        let mut guard = self.resolve_entity_write(&subscription_id).await?;
        let ss = subscription(&guard, subscription_id)?;
        let customer_id = guard.customer.id;
        match &ss.stop {
            Some(record) if record.stopped_at == stopped_at => return Ok(customer_id),
            Some(_) => return Err(EngineError::Conflict(subscription_id)),
            None if ss.is_stopped() => return Err(EngineError::Conflict(subscription_id)),
            None => {}
        }
        let event = Event::SubscriptionStopped {
            customer_id,
            record: StopRecord {
                subscription_id,
                reason,
                stopped_at,
            },
        };
        self.persist_and_apply(&mut guard, &event).await?;
        info!(%subscription_id, %stopped_at, "subscription stopped");
        Ok(customer_id)
    }

    /// Stop every live subscription the customer has for `product_id`.
    /// Returns the subscriptions stopped by this call.
    pub async fn stop_product(
        &self,
        customer_id: Ulid,
        product_id: Ulid,
        reason: Option<String>,
        stopped_at: Date,
    ) -> Result<Vec<Ulid>, EngineError> {
        validate_date(stopped_at)?;
        validate_text(reason.as_deref(), MAX_REASON_LEN, "stop reason too long")?;
        let mut guard = self.customer_write(customer_id).await?;
        let matching: Vec<(Ulid, bool)> = guard
            .subscriptions
            .values()
            .filter(|ss| ss.subscription.product_id == product_id)
            .map(|ss| (ss.subscription.id, ss.is_stopped()))
            .collect();
        if matching.is_empty() {
            return Err(EngineError::NotFound(product_id));
        }

        let mut stopped = Vec::new();
        for (subscription_id, already) in matching {
            if already {
                continue;
            }
            let event = Event::SubscriptionStopped {
                customer_id,
                record: StopRecord {
                    subscription_id,
                    reason: reason.clone(),
                    stopped_at,
                },
            };
            self.persist_and_apply(&mut guard, &event).await?;
            stopped.push(subscription_id);
        }
        info!(%customer_id, %product_id, count = stopped.len(), "product stopped");
        Ok(stopped)
    }

    // ── Date overrides ──────────────────────────────────────

    /// Upsert on (customer, subscription, date). Last write wins.
    pub async fn set_date_override(&self, date_override: DateOverride) -> Result<(), EngineError> {
        validate_date(date_override.date)?;
        if let Some(q) = date_override.quantity {
            validate_quantity(q)?;
        }
        if date_override.quantity.is_none() && date_override.shift.is_none() {
            return Err(EngineError::validation("override sets neither quantity nor shift"));
        }
        let mut guard = self.customer_write(date_override.customer_id).await?;
        let ss = subscription(&guard, date_override.subscription_id)?;
        ensure_not_stopped_on(ss, date_override.date)?;
        match ss.overrides.get(&date_override.date) {
            Some(existing) if *existing == date_override => return Ok(()),
            Some(_) => {}
            None if ss.overrides.len() >= MAX_OVERRIDES_PER_SUBSCRIPTION => {
                return Err(EngineError::LimitExceeded("too many overrides on subscription"));
            }
            None => {}
        }
        let event = Event::OverrideSet { date_override };
        self.persist_and_apply(&mut guard, &event).await
    }

    pub async fn clear_date_override(&self, subscription_id: Ulid, date: Date) -> Result<Ulid, EngineError> {
        let mut guard = self.resolve_entity_write(&subscription_id).await?;
        let ss = subscription(&guard, subscription_id)?;
        if !ss.overrides.contains_key(&date) {
            return Err(EngineError::OverrideNotFound { subscription_id, date });
        }
        let customer_id = guard.customer.id;
        let event = Event::OverrideCleared {
            customer_id,
            subscription_id,
            date,
        };
        self.persist_and_apply(&mut guard, &event).await?;
        Ok(customer_id)
    }

    // ── Added-item ledger ───────────────────────────────────

    /// Record a one-off product. `added_at` is stamped here if the caller left it at zero.
    pub async fn add_one_off_product(&self, mut entry: AddedProductEntry) -> Result<(), EngineError> {
        validate_added_quantity(entry.quantity)?;
        if let Some(date) = entry.date {
            validate_date(date)?;
        }
        validate_text(entry.added_by.as_deref(), MAX_NAME_LEN, "added_by too long")?;
        let mut guard = self.customer_write(entry.customer_id).await?;
        if let Some(existing) = guard.find_addition(entry.id) {
            let same = AddedProductEntry {
                added_at: existing.added_at,
                ..entry.clone()
            } == *existing;
            return if same {
                Ok(())
            } else {
                Err(EngineError::AlreadyExists(entry.id))
            };
        }
        if self.entity_to_customer.contains_key(&entry.id) {
            return Err(EngineError::AlreadyExists(entry.id));
        }
        if guard.additions.len() >= MAX_ADDITIONS_PER_CUSTOMER {
            return Err(EngineError::LimitExceeded("too many added products on customer"));
        }
        if entry.added_at == 0 {
            entry.added_at = now_ms();
        }
        let event = Event::AdditionAdded { entry };
        self.persist_and_apply(&mut guard, &event).await
    }

    pub async fn remove_one_off_product(&self, id: Ulid) -> Result<Ulid, EngineError> {
        let mut guard = self.resolve_entity_write(&id).await?;
        if guard.find_addition(id).is_none() {
            return Err(EngineError::NotFound(id));
        }
        let customer_id = guard.customer.id;
        let event = Event::AdditionRemoved { id, customer_id };
        self.persist_and_apply(&mut guard, &event).await?;
        Ok(customer_id)
    }

    // ── Maintenance ─────────────────────────────────────────

    /// Rewrite the WAL with only the events needed to recreate the current state.
    /// The compaction gate is held exclusively until the new file is in place, so no
    /// mutation is between its append and its apply while the snapshot is taken.
    pub async fn compact_wal(&self) -> Result<(), EngineError> {
        let exclusive = self.compaction_gate.write().await;
        let customers: Vec<_> = self.state.iter().map(|e| e.value().clone()).collect();
        let mut guards = Vec::with_capacity(customers.len());
        for cs in customers {
            guards.push(cs.read_owned().await);
        }

        let mut events = Vec::new();
        for cs in &guards {
            let customer_id = cs.customer.id;
            events.push(Event::CustomerUpserted {
                customer: cs.customer.clone(),
            });
            for ss in cs.subscriptions.values() {
                events.push(Event::SubscriptionCreated {
                    subscription: ss.subscription.clone(),
                });
                events.extend(ss.pauses.iter().map(|p| Event::PauseSet {
                    customer_id,
                    pause: p.clone(),
                }));
                events.extend(ss.overrides.values().map(|o| Event::OverrideSet {
                    date_override: o.clone(),
                }));
                if let Some(record) = &ss.stop {
                    events.push(Event::SubscriptionStopped {
                        customer_id,
                        record: record.clone(),
                    });
                }
            }
            events.extend(cs.additions.iter().map(|e| Event::AdditionAdded { entry: e.clone() }));
        }
        // Orphans are carried over so the integrity failure survives compaction.
        for entry in self.orphans.iter() {
            warn!(customer_id = %entry.key(), "compaction keeps {} orphaned subscriptions", entry.value().len());
            events.extend(entry.value().iter().map(|sub| Event::SubscriptionCreated {
                subscription: sub.clone(),
            }));
        }

        let count = events.len();
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Compact { events, response: tx })
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()))?;
        drop(guards);
        drop(exclusive);
        info!("WAL compacted to {count} events");
        Ok(())
    }

    pub async fn wal_appends_since_compact(&self) -> u64 {
        let (tx, rx) = oneshot::channel();
        if self
            .wal_tx
            .send(WalCommand::AppendsSinceCompact { response: tx })
            .await
            .is_err()
        {
            return 0;
        }
        rx.await.unwrap_or(0)
    }
}
