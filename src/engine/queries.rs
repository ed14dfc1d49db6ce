use futures::stream::{self, Stream, StreamExt};
use ulid::Ulid;

use crate::model::*;

use super::gating::{merged_pauses, DateSpan};
use super::ledger::undated;
use super::projection::{self, *};
use super::resolve::resolve;
use super::validate::{validate_date, validate_range};
use super::{Engine, EngineError, SharedCustomerState};

/// One entry of a streamed delivery list.
#[derive(Debug)]
pub enum ListItem {
    Row(CustomerRow),
    Failure(ResolutionFailure),
}

impl Engine {
    /// Consistent copy of one customer's state, taken under its read lock.
    async fn snapshot(&self, customer_id: Ulid) -> Result<CustomerState, EngineError> {
        let cs = self
            .get_customer(&customer_id)
            .ok_or_else(|| self.missing_customer(customer_id))?;
        let guard = cs.read().await;
        Ok(guard.clone())
    }

    pub async fn resolve(&self, customer_id: Ulid, date: Date) -> Result<ResolvedDelivery, EngineError> {
        validate_date(date)?;
        let cs = self
            .get_customer(&customer_id)
            .ok_or_else(|| self.missing_customer(customer_id))?;
        let guard = cs.read().await;
        resolve(&guard, date)
    }

    /// Resolve an inclusive date range against a single snapshot.
    pub async fn resolve_range(
        &self,
        customer_id: Ulid,
        from: Date,
        to: Date,
    ) -> Result<Vec<ResolvedDelivery>, EngineError> {
        validate_range(from, to)?;
        let cs = self
            .get_customer(&customer_id)
            .ok_or_else(|| self.missing_customer(customer_id))?;
        let guard = cs.read().await;
        dates(from, to).map(|date| resolve(&guard, date)).collect()
    }

    /// Same as [`Engine::resolve_range`], but produced lazily one date at a time.
    /// Dropping the stream stops the work.
    pub async fn stream_range(
        &self,
        customer_id: Ulid,
        from: Date,
        to: Date,
    ) -> Result<impl Stream<Item = Result<ResolvedDelivery, EngineError>> + Send + 'static, EngineError> {
        validate_range(from, to)?;
        let snapshot = self.snapshot(customer_id).await?;
        Ok(stream::iter(dates(from, to)).map(move |date| resolve(&snapshot, date)))
    }

    pub async fn month_view(&self, customer_id: Ulid, year: i32, month: u32) -> Result<MonthView, EngineError> {
        let (first, last) = month_bounds(year, month)?;
        validate_range(first, last)?;
        let cs = self
            .get_customer(&customer_id)
            .ok_or_else(|| self.missing_customer(customer_id))?;
        let guard = cs.read().await;
        projection::month_view(&guard, year, month)
    }

    /// Customers admitted by the filter's customer fields, in list order.
    async fn list_population(&self, filter: &DeliveryFilter) -> Vec<(Customer, SharedCustomerState)> {
        let all: Vec<SharedCustomerState> = self.state.iter().map(|e| e.value().clone()).collect();
        let mut admitted = Vec::new();
        for cs in all {
            let customer = cs.read().await.customer.clone();
            if filter.admits_customer(&customer) {
                admitted.push((customer, cs));
            }
        }
        admitted.sort_by_key(|(c, _)| customer_sort_key(c));
        admitted
    }

    /// Delivery list rows for one date, streamed customer by customer.
    ///
    /// Each row is resolved under that customer's read lock at the moment it is
    /// produced. Records that fail resolution come through as failures, and
    /// orphaned subscriptions are reported at the end.
    pub async fn stream_delivery_list(
        &self,
        filter: DeliveryFilter,
    ) -> Result<impl Stream<Item = ListItem> + Send + 'static, EngineError> {
        validate_date(filter.date)?;
        let population = self.list_population(&filter).await;
        let orphans: Vec<ListItem> = self
            .orphans
            .iter()
            .filter(|_| filter.admits_missing_customer())
            .flat_map(|e| {
                let customer_id = *e.key();
                e.value()
                    .iter()
                    .map(|sub| {
                        ListItem::Failure(ResolutionFailure {
                            customer_id,
                            error: EngineError::Integrity {
                                subscription_id: sub.id,
                                customer_id,
                            },
                        })
                    })
                    .collect::<Vec<_>>()
            })
            .collect();

        let rows = stream::iter(population)
            .then(move |(_, cs)| {
                let filter = filter.clone();
                async move {
                    let guard = cs.read().await;
                    // Re-check: the customer may have changed since the population was taken.
                    if !filter.admits_customer(&guard.customer) {
                        return None;
                    }
                    match resolve(&guard, filter.date) {
                        Ok(delivery) => shape_row(&guard.customer, delivery, &filter).map(ListItem::Row),
                        Err(error) => Some(ListItem::Failure(ResolutionFailure {
                            customer_id: guard.customer.id,
                            error,
                        })),
                    }
                }
            })
            .filter_map(futures::future::ready);
        Ok(rows.chain(stream::iter(orphans)))
    }

    /// The whole delivery list for a date, with per-product totals.
    pub async fn delivery_list(&self, filter: DeliveryFilter) -> Result<DeliveryList, EngineError> {
        let date = filter.date;
        let items: Vec<ListItem> = self.stream_delivery_list(filter).await?.collect().await;
        let mut rows = Vec::new();
        let mut failures = Vec::new();
        for item in items {
            match item {
                ListItem::Row(row) => rows.push(row),
                ListItem::Failure(f) => failures.push(f),
            }
        }
        let totals = product_totals(&rows);
        Ok(DeliveryList {
            date,
            rows,
            totals,
            failures,
        })
    }

    pub async fn product_totals(&self, filter: DeliveryFilter) -> Result<Vec<ProductTotal>, EngineError> {
        Ok(self.delivery_list(filter).await?.totals)
    }

    // ── Listings ────────────────────────────────────────────

    pub async fn list_customers(&self) -> Vec<Customer> {
        let all: Vec<SharedCustomerState> = self.state.iter().map(|e| e.value().clone()).collect();
        let mut customers = Vec::with_capacity(all.len());
        for cs in all {
            customers.push(cs.read().await.customer.clone());
        }
        customers.sort_by_key(customer_sort_key);
        customers
    }

    pub async fn get_subscriptions(&self, customer_id: Ulid) -> Vec<Subscription> {
        let Some(cs) = self.get_customer(&customer_id) else {
            return vec![];
        };
        let guard = cs.read().await;
        guard.subscriptions.values().map(|ss| ss.subscription.clone()).collect()
    }

    pub async fn get_stop(&self, subscription_id: Ulid) -> Option<StopRecord> {
        let cs = self.get_customer(&self.get_customer_for_entity(&subscription_id)?)?;
        let guard = cs.read().await;
        guard.subscriptions.get(&subscription_id)?.stop.clone()
    }

    pub async fn get_pauses(&self, subscription_id: Ulid) -> Vec<PauseInterval> {
        self.with_subscription(subscription_id, |ss| ss.pauses.clone())
            .await
            .unwrap_or_default()
    }

    /// Pauses collapsed into disjoint spans, for display.
    pub async fn get_merged_pauses(&self, subscription_id: Ulid) -> Vec<DateSpan> {
        self.with_subscription(subscription_id, |ss| merged_pauses(&ss.pauses))
            .await
            .unwrap_or_default()
    }

    pub async fn get_overrides(&self, subscription_id: Ulid) -> Vec<DateOverride> {
        self.with_subscription(subscription_id, |ss| ss.overrides.values().cloned().collect())
            .await
            .unwrap_or_default()
    }

    pub async fn get_additions(&self, customer_id: Ulid) -> Vec<AddedProductEntry> {
        let Some(cs) = self.get_customer(&customer_id) else {
            return vec![];
        };
        cs.read().await.additions.clone()
    }

    /// Entries with no date yet. They wait for a planner and never resolve.
    pub async fn get_undated_additions(&self, customer_id: Ulid) -> Vec<AddedProductEntry> {
        let Some(cs) = self.get_customer(&customer_id) else {
            return vec![];
        };
        undated(&cs.read().await.additions).to_vec()
    }

    async fn with_subscription<T>(&self, subscription_id: Ulid, f: impl FnOnce(&SubscriptionState) -> T) -> Option<T> {
        let cs = self.get_customer(&self.get_customer_for_entity(&subscription_id)?)?;
        let guard = cs.read().await;
        guard.subscriptions.get(&subscription_id).map(f)
    }
}
