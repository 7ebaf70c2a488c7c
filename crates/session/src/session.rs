//! The review session: explicit per-collection context and operation surface.

use chrono::Utc;
use thiserror::Error;
use uuid::Uuid;

use deadstock_core::{Aggregate, AggregateId, AggregateRoot, DomainError, ItemId, SiteId};
use deadstock_events::{Command, EventBus, EventEnvelope, execute};
use deadstock_review::{
    BulkClearDispositions, BulkSetDisposition, BulkSetRestockable, ConvertFullBillPartials,
    DeadstockItem, DeadstockReview, Disposition, Finalize, FinalizeBlockers, ItemSnapshot,
    LoadSnapshot, QuantityField, ReviewCommand, ReviewEvent, ReviewId, Role, SetDisposition,
    SetQuantity, SetUnreturnableReason, SubmitFinalApproval, ToggleRestockable,
    UnreturnableReason,
};

use crate::outcome::{ActionAvailability, OperationOutcome, ReviewSummary};
use crate::store::{CheckpointError, CheckpointStore};

/// Stream type identifier for published review envelopes.
const AGGREGATE_TYPE: &str = "deadstock.review";

/// Session-level error as seen by the caller.
///
/// Nothing here is fatal — the collection stays usable after any rejection.
#[derive(Debug, Error)]
pub enum SessionError {
    /// Deterministic domain rejection (validation, invariants, locking).
    #[error(transparent)]
    Domain(#[from] DomainError),

    /// Finalize is blocked; the report carries the offending lines per
    /// condition for the caller's corrective prompt.
    #[error(
        "finalize rejected: {} missing dispositions, {} no-op partials, {} unexplained shortfalls",
        .0.missing_disposition.len(),
        .0.full_bill_partials.len(),
        .0.unexplained_shortfalls.len()
    )]
    FinalizeRejected(FinalizeBlockers),

    /// The persistence collaborator failed; in-memory state and the
    /// checkpoint are unchanged and the operation may be retried.
    #[error(transparent)]
    Persistence(#[from] CheckpointError),
}

/// One actor's working session over a loaded deadstock collection.
///
/// Owns the aggregate and the last confirmed checkpoint; every operation is
/// synchronous domain work except the three that wrap the persistence
/// boundary (`save`, `finalize`, `submit_final_approval`). Committed events
/// are published to the injected bus after they are applied (best-effort;
/// subscribers must be idempotent).
pub struct ReviewSession<S, B> {
    review: DeadstockReview,
    checkpoint: Vec<DeadstockItem>,
    site_id: SiteId,
    role: Role,
    store: S,
    bus: B,
}

impl<S, B> ReviewSession<S, B>
where
    S: CheckpointStore,
    B: EventBus<EventEnvelope<ReviewEvent>>,
{
    /// Load a collaborator-supplied inventory snapshot into a fresh
    /// session and take the initial checkpoint.
    pub fn load(
        site_id: SiteId,
        role: Role,
        snapshot: Vec<ItemSnapshot>,
        store: S,
        bus: B,
    ) -> Result<Self, SessionError> {
        let review_id = ReviewId::new(AggregateId::new());
        let mut review = DeadstockReview::empty(review_id);
        let events = execute(
            &mut review,
            &ReviewCommand::LoadSnapshot(LoadSnapshot {
                site_id,
                review_id,
                items: snapshot,
                occurred_at: Utc::now(),
            }),
        )?;

        let session = Self {
            checkpoint: review.items().to_vec(),
            site_id,
            role,
            store,
            bus,
            review,
        };
        session.publish(&events);
        tracing::info!(
            site_id = %site_id,
            items = session.review.items().len(),
            role = ?role,
            "deadstock review loaded"
        );
        Ok(session)
    }

    pub fn site_id(&self) -> SiteId {
        self.site_id
    }

    pub fn role(&self) -> Role {
        self.role
    }

    /// Switch the acting role (the customer/representative mode toggle).
    /// Eligibility rules are evaluated per operation, so this takes effect
    /// immediately.
    pub fn set_role(&mut self, role: Role) {
        self.role = role;
    }

    pub fn review(&self) -> &DeadstockReview {
        &self.review
    }

    pub fn items(&self) -> &[DeadstockItem] {
        self.review.items()
    }

    pub fn item(&self, item_id: ItemId) -> Option<&DeadstockItem> {
        self.review.item(item_id)
    }

    pub fn summary(&self) -> ReviewSummary {
        ReviewSummary::compute(self.review.items())
    }

    pub fn actions(&self) -> ActionAvailability {
        ActionAvailability::compute(self.role, self.review.items())
    }

    /// What currently blocks `finalize` for this session's role.
    pub fn finalize_blockers(&self) -> FinalizeBlockers {
        self.review.finalize_blockers(self.role)
    }

    pub fn set_disposition(
        &mut self,
        item_id: ItemId,
        disposition: Option<Disposition>,
    ) -> Result<OperationOutcome, SessionError> {
        self.dispatch(ReviewCommand::SetDisposition(SetDisposition {
            site_id: self.site_id,
            review_id: self.review.id_typed(),
            actor: self.role,
            item_id,
            disposition,
            occurred_at: Utc::now(),
        }))
    }

    pub fn set_quantity(
        &mut self,
        item_id: ItemId,
        field: QuantityField,
        raw: i64,
    ) -> Result<OperationOutcome, SessionError> {
        self.dispatch(ReviewCommand::SetQuantity(SetQuantity {
            site_id: self.site_id,
            review_id: self.review.id_typed(),
            actor: self.role,
            item_id,
            field,
            raw,
            occurred_at: Utc::now(),
        }))
    }

    pub fn set_unreturnable_reason(
        &mut self,
        item_id: ItemId,
        reason: Option<UnreturnableReason>,
    ) -> Result<OperationOutcome, SessionError> {
        self.dispatch(ReviewCommand::SetUnreturnableReason(SetUnreturnableReason {
            site_id: self.site_id,
            review_id: self.review.id_typed(),
            actor: self.role,
            item_id,
            reason,
            occurred_at: Utc::now(),
        }))
    }

    pub fn toggle_restockable(&mut self, item_id: ItemId) -> Result<OperationOutcome, SessionError> {
        self.dispatch(ReviewCommand::ToggleRestockable(ToggleRestockable {
            site_id: self.site_id,
            review_id: self.review.id_typed(),
            actor: self.role,
            item_id,
            occurred_at: Utc::now(),
        }))
    }

    pub fn bulk_set_disposition(
        &mut self,
        disposition: Disposition,
    ) -> Result<OperationOutcome, SessionError> {
        self.dispatch(ReviewCommand::BulkSetDisposition(BulkSetDisposition {
            site_id: self.site_id,
            review_id: self.review.id_typed(),
            actor: self.role,
            disposition,
            occurred_at: Utc::now(),
        }))
    }

    pub fn bulk_clear_dispositions(&mut self) -> Result<OperationOutcome, SessionError> {
        self.dispatch(ReviewCommand::BulkClearDispositions(BulkClearDispositions {
            site_id: self.site_id,
            review_id: self.review.id_typed(),
            actor: self.role,
            occurred_at: Utc::now(),
        }))
    }

    pub fn bulk_set_restockable(
        &mut self,
        restockable: bool,
    ) -> Result<OperationOutcome, SessionError> {
        self.dispatch(ReviewCommand::BulkSetRestockable(BulkSetRestockable {
            site_id: self.site_id,
            review_id: self.review.id_typed(),
            actor: self.role,
            restockable,
            occurred_at: Utc::now(),
        }))
    }

    /// The corrective action offered by the finalize prompt: rewrite
    /// no-op partial lines to invoice-all.
    pub fn convert_full_bill_partials(&mut self) -> Result<OperationOutcome, SessionError> {
        self.dispatch(ReviewCommand::ConvertFullBillPartials(ConvertFullBillPartials {
            site_id: self.site_id,
            review_id: self.review.id_typed(),
            actor: self.role,
            occurred_at: Utc::now(),
        }))
    }

    /// Persist the current collection as the new checkpoint.
    pub async fn save(&mut self) -> Result<OperationOutcome, SessionError> {
        if self.review.is_locked() {
            return Err(SessionError::Domain(DomainError::locked(
                "final approval received; the collection is locked",
            )));
        }
        let pending = self.summary().pending_decisions;
        if pending > 0 {
            return Err(SessionError::Domain(DomainError::validation(format!(
                "{pending} items still need a disposition"
            ))));
        }

        self.store
            .save_checkpoint(self.site_id, self.review.items())
            .await
            .inspect_err(|err| tracing::warn!(site_id = %self.site_id, %err, "save failed"))?;
        self.checkpoint = self.review.items().to_vec();
        tracing::info!(site_id = %self.site_id, "checkpoint saved");
        Ok(self.outcome(Vec::new()))
    }

    /// Confirm the current round of decisions: gate, auto-convert, persist,
    /// then commit. A persistence failure leaves memory and checkpoint
    /// untouched.
    pub async fn finalize(&mut self) -> Result<OperationOutcome, SessionError> {
        let blockers = self.finalize_blockers();
        if !blockers.is_clean() {
            return Err(SessionError::FinalizeRejected(blockers));
        }

        let command = ReviewCommand::Finalize(Finalize {
            site_id: self.site_id,
            review_id: self.review.id_typed(),
            actor: self.role,
            occurred_at: Utc::now(),
        });
        self.commit(command).await
    }

    /// Customer-only terminal transition; permanently locks the
    /// collection on success. The optional purchase-order reference is
    /// recorded on the review, not on items.
    pub async fn submit_final_approval(
        &mut self,
        po_number: Option<String>,
    ) -> Result<OperationOutcome, SessionError> {
        let command = ReviewCommand::SubmitFinalApproval(SubmitFinalApproval {
            site_id: self.site_id,
            review_id: self.review.id_typed(),
            actor: self.role,
            po_number,
            occurred_at: Utc::now(),
        });
        let outcome = self.commit(command).await?;
        tracing::info!(site_id = %self.site_id, "final approval received; collection locked");
        Ok(outcome)
    }

    /// Discard unsaved edits, restoring the last confirmed checkpoint.
    pub fn reset(&mut self) -> Result<OperationOutcome, SessionError> {
        if self.review.is_locked() {
            return Err(SessionError::Domain(DomainError::locked(
                "final approval received; the collection is locked",
            )));
        }

        let affected: Vec<ItemId> = self
            .checkpoint
            .iter()
            .map(DeadstockItem::item_id)
            .collect();
        self.review.restore_items(self.checkpoint.clone());
        Ok(self.outcome(affected))
    }

    /// Run a pure domain command: decide, evolve, publish, report.
    fn dispatch(&mut self, command: ReviewCommand) -> Result<OperationOutcome, SessionError> {
        let aggregate_id = command.target_aggregate_id();
        let events = execute(&mut self.review, &command)?;
        self.publish(&events);
        let affected = affected_items(&events);
        tracing::debug!(
            aggregate_id = %aggregate_id,
            events = events.len(),
            affected = affected.len(),
            "review command applied"
        );
        Ok(self.outcome(affected))
    }

    /// Run a command whose effects must be persisted before they become
    /// visible: decide, stage, save checkpoint, then swap in and publish.
    async fn commit(&mut self, command: ReviewCommand) -> Result<OperationOutcome, SessionError> {
        let events = self.review.handle(&command).map_err(SessionError::Domain)?;

        let mut staged = self.review.clone();
        for event in &events {
            staged.apply(event);
        }

        self.store
            .save_checkpoint(self.site_id, staged.items())
            .await
            .inspect_err(|err| tracing::warn!(site_id = %self.site_id, %err, "commit failed"))?;

        self.review = staged;
        self.checkpoint = self.review.items().to_vec();
        self.publish(&events);

        let mut affected = affected_items(&events);
        if events
            .iter()
            .any(|event| matches!(event, ReviewEvent::FinalApprovalReceived(_)))
        {
            affected = self.review.items().iter().map(DeadstockItem::item_id).collect();
        }
        Ok(self.outcome(affected))
    }

    /// Best-effort publication. Events are already applied; a failed
    /// publish is logged and subscribers rebuild from the next checkpoint.
    fn publish(&self, events: &[ReviewEvent]) {
        let base = self.review.version() - events.len() as u64;
        for (offset, event) in events.iter().enumerate() {
            let envelope = EventEnvelope::new(
                Uuid::now_v7(),
                self.site_id,
                self.review.id_typed().0,
                AGGREGATE_TYPE,
                base + offset as u64 + 1,
                event.clone(),
            );
            if let Err(err) = self.bus.publish(envelope) {
                tracing::warn!(?err, "event publication failed");
            }
        }
    }

    fn outcome(&self, affected: Vec<ItemId>) -> OperationOutcome {
        OperationOutcome {
            updated: affected
                .iter()
                .filter_map(|item_id| self.review.item(*item_id))
                .cloned()
                .collect(),
            summary: self.summary(),
            actions: self.actions(),
        }
    }
}

/// Distinct per-item event targets, in event order.
fn affected_items(events: &[ReviewEvent]) -> Vec<ItemId> {
    let mut affected = Vec::new();
    for event in events {
        let item_id = match event {
            ReviewEvent::DispositionChanged(e) => Some(e.item_id),
            ReviewEvent::QuantityChanged(e) => Some(e.item_id),
            ReviewEvent::UnreturnableReasonChanged(e) => Some(e.item_id),
            ReviewEvent::RestockableChanged(e) => Some(e.item_id),
            ReviewEvent::SnapshotLoaded(_)
            | ReviewEvent::ReviewFinalized(_)
            | ReviewEvent::FinalApprovalReceived(_) => None,
        };
        if let Some(item_id) = item_id {
            if !affected.contains(&item_id) {
                affected.push(item_id);
            }
        }
    }
    affected
}
