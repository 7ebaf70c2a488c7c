//! Disposable read model for the presentation collaborator.

use std::collections::HashMap;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use deadstock_core::{Aggregate, AggregateId, ItemId, SiteId, StockManagementId};
use deadstock_events::{EventEnvelope, Projection};
use deadstock_review::{
    DeadstockItem, DeadstockReview, Disposition, ItemStatus, ReviewEvent, ReviewId,
    UnreturnableReason,
};

use crate::read_model::SiteStore;

/// Queryable board row: everything the table UI needs for one line,
/// derived fields included. Rebuildable from the event stream at any time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BoardRow {
    pub item_id: ItemId,
    pub stock_management_id: StockManagementId,
    pub part_number: String,
    pub description: String,
    pub location_name: String,
    pub supplier_name: String,
    pub last_issue_date: Option<NaiveDate>,
    pub qty_on_hand: i64,
    pub package_size: i64,
    pub unit_price_cents: u64,
    pub disposition: Option<Disposition>,
    pub qty_to_bill: i64,
    pub qty_to_remove: i64,
    pub qty_removed: Option<i64>,
    pub qty_unreturnable: Option<i64>,
    pub unreturnable_reason: Option<UnreturnableReason>,
    pub is_restockable: bool,
    pub min_level: Option<i64>,
    pub max_level: Option<i64>,
    pub status: ItemStatus,
}

impl From<&DeadstockItem> for BoardRow {
    fn from(item: &DeadstockItem) -> Self {
        Self {
            item_id: item.item_id(),
            stock_management_id: item.stock_management_id(),
            part_number: item.part_number().to_string(),
            description: item.description().to_string(),
            location_name: item.location_name().to_string(),
            supplier_name: item.supplier_name().to_string(),
            last_issue_date: item.last_issue_date(),
            qty_on_hand: item.qty_on_hand(),
            package_size: item.packaging().package_size(),
            unit_price_cents: item.unit_price_cents(),
            disposition: item.disposition(),
            qty_to_bill: item.qty_to_bill(),
            qty_to_remove: item.qty_to_remove(),
            qty_removed: item.qty_removed(),
            qty_unreturnable: item.qty_unreturnable(),
            unreturnable_reason: item.unreturnable_reason().cloned(),
            is_restockable: item.is_restockable(),
            min_level: item.min_level(),
            max_level: item.max_level(),
            status: item.status(),
        }
    }
}

#[derive(Debug, Error)]
pub enum BoardProjectionError {
    #[error("site isolation violation: {0}")]
    SiteIsolation(String),

    #[error("non-monotonic sequence number (last={last}, found={found})")]
    NonMonotonicSequence { last: u64, found: u64 },
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
struct StreamKey {
    site_id: SiteId,
    aggregate_id: AggregateId,
}

#[derive(Debug)]
struct Replica {
    review: DeadstockReview,
    cursor: u64,
}

/// Review board projection.
///
/// Replays published envelopes through a local replica of the aggregate and
/// keeps a site-isolated row per item in the backing store.
///
/// - Enforces site isolation between the envelope and its payload
/// - Enforces monotonic sequence per (site, aggregate) stream
/// - Idempotent for at-least-once delivery (replays <= cursor are ignored)
#[derive(Debug)]
pub struct ReviewBoardProjection<S>
where
    S: SiteStore<ItemId, BoardRow>,
{
    store: S,
    replicas: HashMap<StreamKey, Replica>,
}

impl<S> ReviewBoardProjection<S>
where
    S: SiteStore<ItemId, BoardRow>,
{
    pub fn new(store: S) -> Self {
        Self {
            store,
            replicas: HashMap::new(),
        }
    }

    /// Query one row.
    pub fn get(&self, site_id: SiteId, item_id: &ItemId) -> Option<BoardRow> {
        self.store.get(site_id, item_id)
    }

    /// List all rows for a site.
    pub fn list(&self, site_id: SiteId) -> Vec<BoardRow> {
        self.store.list(site_id)
    }

    /// Apply a published envelope into the projection.
    pub fn apply_envelope(
        &mut self,
        envelope: &EventEnvelope<ReviewEvent>,
    ) -> Result<(), BoardProjectionError> {
        let site_id = envelope.site_id();
        if event_site_id(envelope.payload()) != site_id {
            return Err(BoardProjectionError::SiteIsolation(
                "event site_id does not match envelope site_id".to_string(),
            ));
        }

        let key = StreamKey {
            site_id,
            aggregate_id: envelope.aggregate_id(),
        };
        let replica = self.replicas.entry(key).or_insert_with(|| Replica {
            review: DeadstockReview::empty(ReviewId::new(envelope.aggregate_id())),
            cursor: 0,
        });

        let sequence = envelope.sequence_number();
        if sequence != 0 && sequence <= replica.cursor {
            // Duplicate or replay; safe to ignore.
            return Ok(());
        }
        // The first envelope may start at any positive sequence; after
        // that, strict increments only.
        if sequence == 0 || (replica.cursor != 0 && sequence != replica.cursor + 1) {
            return Err(BoardProjectionError::NonMonotonicSequence {
                last: replica.cursor,
                found: sequence,
            });
        }

        replica.review.apply(envelope.payload());
        replica.cursor = sequence;

        let review = &self.replicas[&key].review;
        match envelope.payload() {
            ReviewEvent::DispositionChanged(e) => {
                if let Some(item) = review.item(e.item_id) {
                    self.upsert_row(site_id, item);
                }
            }
            ReviewEvent::QuantityChanged(e) => {
                if let Some(item) = review.item(e.item_id) {
                    self.upsert_row(site_id, item);
                }
            }
            ReviewEvent::UnreturnableReasonChanged(e) => {
                if let Some(item) = review.item(e.item_id) {
                    self.upsert_row(site_id, item);
                }
            }
            ReviewEvent::RestockableChanged(e) => {
                if let Some(item) = review.item(e.item_id) {
                    self.upsert_row(site_id, item);
                }
            }
            ReviewEvent::SnapshotLoaded(_) | ReviewEvent::FinalApprovalReceived(_) => {
                for item in review.items() {
                    self.upsert_row(site_id, item);
                }
            }
            ReviewEvent::ReviewFinalized(_) => {}
        }
        Ok(())
    }

    fn upsert_row(&self, site_id: SiteId, item: &DeadstockItem) {
        self.store.upsert(site_id, item.item_id(), BoardRow::from(item));
    }
}

impl<S> Projection for ReviewBoardProjection<S>
where
    S: SiteStore<ItemId, BoardRow>,
{
    type Ev = ReviewEvent;

    fn apply(&mut self, envelope: &EventEnvelope<ReviewEvent>) {
        if let Err(err) = self.apply_envelope(envelope) {
            tracing::warn!(%err, "envelope dropped by board projection");
        }
    }
}

fn event_site_id(event: &ReviewEvent) -> SiteId {
    match event {
        ReviewEvent::SnapshotLoaded(e) => e.site_id,
        ReviewEvent::DispositionChanged(e) => e.site_id,
        ReviewEvent::QuantityChanged(e) => e.site_id,
        ReviewEvent::UnreturnableReasonChanged(e) => e.site_id,
        ReviewEvent::RestockableChanged(e) => e.site_id,
        ReviewEvent::ReviewFinalized(e) => e.site_id,
        ReviewEvent::FinalApprovalReceived(e) => e.site_id,
    }
}
