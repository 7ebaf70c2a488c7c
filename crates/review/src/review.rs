//! The deadstock review aggregate: one customer site's consignment
//! collection moving through the disposition workflow as a unit.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use deadstock_core::{Aggregate, AggregateId, AggregateRoot, DomainError, ItemId, SiteId};
use deadstock_events::{Command, Event};

use crate::disposition::{self, Disposition};
use crate::item::{DeadstockItem, ItemSnapshot, UnreturnableReason};
use crate::role::Role;
use crate::status::ItemStatus;

/// Review identifier (site-scoped via `site_id` fields in events/commands).
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ReviewId(pub AggregateId);

impl ReviewId {
    pub fn new(id: AggregateId) -> Self {
        Self(id)
    }
}

impl core::fmt::Display for ReviewId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        core::fmt::Display::fmt(&self.0, f)
    }
}

/// Quantity column being edited.
///
/// A closed set of column semantics, matched exhaustively: the engine never
/// dispatches on field-name strings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QuantityField {
    ToBill,
    Removed,
    MinLevel,
    MaxLevel,
}

/// Conditions blocking `Finalize`, with the offending lines per condition
/// so the caller can build its corrective prompt.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FinalizeBlockers {
    /// Lines still awaiting a disposition decision.
    pub missing_disposition: Vec<ItemId>,
    /// Invoice-partial lines billing the full on-hand quantity (a no-op
    /// partial that should be invoice-all).
    pub full_bill_partials: Vec<ItemId>,
    /// Lines with a recorded removal short of the staged removal and no
    /// explanation (representative finalize only).
    pub unexplained_shortfalls: Vec<ItemId>,
}

impl FinalizeBlockers {
    pub fn is_clean(&self) -> bool {
        self.missing_disposition.is_empty()
            && self.full_bill_partials.is_empty()
            && self.unexplained_shortfalls.is_empty()
    }
}

/// Command: LoadSnapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoadSnapshot {
    pub site_id: SiteId,
    pub review_id: ReviewId,
    pub items: Vec<ItemSnapshot>,
    pub occurred_at: DateTime<Utc>,
}

/// Command: SetDisposition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SetDisposition {
    pub site_id: SiteId,
    pub review_id: ReviewId,
    pub actor: Role,
    pub item_id: ItemId,
    pub disposition: Option<Disposition>,
    pub occurred_at: DateTime<Utc>,
}

/// Command: SetQuantity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SetQuantity {
    pub site_id: SiteId,
    pub review_id: ReviewId,
    pub actor: Role,
    pub item_id: ItemId,
    pub field: QuantityField,
    pub raw: i64,
    pub occurred_at: DateTime<Utc>,
}

/// Command: SetUnreturnableReason.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SetUnreturnableReason {
    pub site_id: SiteId,
    pub review_id: ReviewId,
    pub actor: Role,
    pub item_id: ItemId,
    pub reason: Option<UnreturnableReason>,
    pub occurred_at: DateTime<Utc>,
}

/// Command: ToggleRestockable.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToggleRestockable {
    pub site_id: SiteId,
    pub review_id: ReviewId,
    pub actor: Role,
    pub item_id: ItemId,
    pub occurred_at: DateTime<Utc>,
}

/// Command: BulkSetDisposition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BulkSetDisposition {
    pub site_id: SiteId,
    pub review_id: ReviewId,
    pub actor: Role,
    pub disposition: Disposition,
    pub occurred_at: DateTime<Utc>,
}

/// Command: BulkClearDispositions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BulkClearDispositions {
    pub site_id: SiteId,
    pub review_id: ReviewId,
    pub actor: Role,
    pub occurred_at: DateTime<Utc>,
}

/// Command: BulkSetRestockable.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BulkSetRestockable {
    pub site_id: SiteId,
    pub review_id: ReviewId,
    pub actor: Role,
    pub restockable: bool,
    pub occurred_at: DateTime<Utc>,
}

/// Command: Finalize.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Finalize {
    pub site_id: SiteId,
    pub review_id: ReviewId,
    pub actor: Role,
    pub occurred_at: DateTime<Utc>,
}

/// Command: ConvertFullBillPartials.
///
/// The explicit corrective action offered when finalize flags no-op
/// partials: rewrite them to invoice-all.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConvertFullBillPartials {
    pub site_id: SiteId,
    pub review_id: ReviewId,
    pub actor: Role,
    pub occurred_at: DateTime<Utc>,
}

/// Command: SubmitFinalApproval.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubmitFinalApproval {
    pub site_id: SiteId,
    pub review_id: ReviewId,
    pub actor: Role,
    /// Optional purchase-order reference, recorded on the review itself.
    pub po_number: Option<String>,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReviewCommand {
    LoadSnapshot(LoadSnapshot),
    SetDisposition(SetDisposition),
    SetQuantity(SetQuantity),
    SetUnreturnableReason(SetUnreturnableReason),
    ToggleRestockable(ToggleRestockable),
    BulkSetDisposition(BulkSetDisposition),
    BulkClearDispositions(BulkClearDispositions),
    BulkSetRestockable(BulkSetRestockable),
    Finalize(Finalize),
    ConvertFullBillPartials(ConvertFullBillPartials),
    SubmitFinalApproval(SubmitFinalApproval),
}

impl Command for ReviewCommand {
    fn target_aggregate_id(&self) -> AggregateId {
        match self {
            ReviewCommand::LoadSnapshot(c) => c.review_id.0,
            ReviewCommand::SetDisposition(c) => c.review_id.0,
            ReviewCommand::SetQuantity(c) => c.review_id.0,
            ReviewCommand::SetUnreturnableReason(c) => c.review_id.0,
            ReviewCommand::ToggleRestockable(c) => c.review_id.0,
            ReviewCommand::BulkSetDisposition(c) => c.review_id.0,
            ReviewCommand::BulkClearDispositions(c) => c.review_id.0,
            ReviewCommand::BulkSetRestockable(c) => c.review_id.0,
            ReviewCommand::Finalize(c) => c.review_id.0,
            ReviewCommand::ConvertFullBillPartials(c) => c.review_id.0,
            ReviewCommand::SubmitFinalApproval(c) => c.review_id.0,
        }
    }
}

/// Event: SnapshotLoaded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotLoaded {
    pub site_id: SiteId,
    pub review_id: ReviewId,
    pub items: Vec<ItemSnapshot>,
    pub occurred_at: DateTime<Utc>,
}

/// Event: DispositionChanged.
///
/// Carries the resulting quantities so replay needs no re-derivation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DispositionChanged {
    pub site_id: SiteId,
    pub review_id: ReviewId,
    pub item_id: ItemId,
    pub disposition: Option<Disposition>,
    pub qty_to_bill: i64,
    pub qty_removed: Option<i64>,
    pub occurred_at: DateTime<Utc>,
}

/// Event: QuantityChanged. `value` is the snapped quantity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuantityChanged {
    pub site_id: SiteId,
    pub review_id: ReviewId,
    pub item_id: ItemId,
    pub field: QuantityField,
    pub value: i64,
    pub occurred_at: DateTime<Utc>,
}

/// Event: UnreturnableReasonChanged.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnreturnableReasonChanged {
    pub site_id: SiteId,
    pub review_id: ReviewId,
    pub item_id: ItemId,
    pub reason: Option<UnreturnableReason>,
    pub occurred_at: DateTime<Utc>,
}

/// Event: RestockableChanged.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RestockableChanged {
    pub site_id: SiteId,
    pub review_id: ReviewId,
    pub item_id: ItemId,
    pub restockable: bool,
    pub occurred_at: DateTime<Utc>,
}

/// Event: ReviewFinalized (one round of decisions confirmed).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReviewFinalized {
    pub site_id: SiteId,
    pub review_id: ReviewId,
    pub actor: Role,
    pub occurred_at: DateTime<Utc>,
}

/// Event: FinalApprovalReceived (terminal; the collection locks).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FinalApprovalReceived {
    pub site_id: SiteId,
    pub review_id: ReviewId,
    pub po_number: Option<String>,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReviewEvent {
    SnapshotLoaded(SnapshotLoaded),
    DispositionChanged(DispositionChanged),
    QuantityChanged(QuantityChanged),
    UnreturnableReasonChanged(UnreturnableReasonChanged),
    RestockableChanged(RestockableChanged),
    ReviewFinalized(ReviewFinalized),
    FinalApprovalReceived(FinalApprovalReceived),
}

impl Event for ReviewEvent {
    fn event_type(&self) -> &'static str {
        match self {
            ReviewEvent::SnapshotLoaded(_) => "review.snapshot_loaded",
            ReviewEvent::DispositionChanged(_) => "review.item.disposition_changed",
            ReviewEvent::QuantityChanged(_) => "review.item.quantity_changed",
            ReviewEvent::UnreturnableReasonChanged(_) => "review.item.unreturnable_reason_changed",
            ReviewEvent::RestockableChanged(_) => "review.item.restockable_changed",
            ReviewEvent::ReviewFinalized(_) => "review.finalized",
            ReviewEvent::FinalApprovalReceived(_) => "review.final_approval_received",
        }
    }

    fn version(&self) -> u32 {
        1
    }

    fn occurred_at(&self) -> DateTime<Utc> {
        match self {
            ReviewEvent::SnapshotLoaded(e) => e.occurred_at,
            ReviewEvent::DispositionChanged(e) => e.occurred_at,
            ReviewEvent::QuantityChanged(e) => e.occurred_at,
            ReviewEvent::UnreturnableReasonChanged(e) => e.occurred_at,
            ReviewEvent::RestockableChanged(e) => e.occurred_at,
            ReviewEvent::ReviewFinalized(e) => e.occurred_at,
            ReviewEvent::FinalApprovalReceived(e) => e.occurred_at,
        }
    }
}

/// Aggregate root: DeadstockReview.
///
/// The whole collection advances and locks together: bulk operations and
/// both gates reason over every line at once.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeadstockReview {
    id: ReviewId,
    site_id: Option<SiteId>,
    items: Vec<DeadstockItem>,
    po_number: Option<String>,
    last_finalized_at: Option<DateTime<Utc>>,
    version: u64,
    loaded: bool,
}

impl DeadstockReview {
    /// Create an empty, not-yet-loaded aggregate instance.
    pub fn empty(id: ReviewId) -> Self {
        Self {
            id,
            site_id: None,
            items: Vec::new(),
            po_number: None,
            last_finalized_at: None,
            version: 0,
            loaded: false,
        }
    }

    pub fn id_typed(&self) -> ReviewId {
        self.id
    }

    pub fn site_id(&self) -> Option<SiteId> {
        self.site_id
    }

    pub fn is_loaded(&self) -> bool {
        self.loaded
    }

    /// Items in snapshot order.
    pub fn items(&self) -> &[DeadstockItem] {
        &self.items
    }

    pub fn item(&self, item_id: ItemId) -> Option<&DeadstockItem> {
        self.items.iter().find(|item| item.item_id() == item_id)
    }

    pub fn po_number(&self) -> Option<&str> {
        self.po_number.as_deref()
    }

    pub fn last_finalized_at(&self) -> Option<DateTime<Utc>> {
        self.last_finalized_at
    }

    /// Final approval has been received; nothing may change anymore.
    pub fn is_locked(&self) -> bool {
        self.items.iter().any(DeadstockItem::is_locked)
    }

    /// What currently blocks `Finalize` for the given actor.
    ///
    /// The shortfall rule applies to the representative's finalize only;
    /// the customer confirms decisions before removals are verified.
    pub fn finalize_blockers(&self, actor: Role) -> FinalizeBlockers {
        let mut blockers = FinalizeBlockers::default();
        for item in &self.items {
            match item.disposition() {
                None => blockers.missing_disposition.push(item.item_id()),
                Some(Disposition::InvoicePartial) if item.qty_to_bill() == item.qty_on_hand() => {
                    blockers.full_bill_partials.push(item.item_id());
                }
                Some(_) => {}
            }
            if actor == Role::Representative && item.has_unexplained_shortfall() {
                blockers.unexplained_shortfalls.push(item.item_id());
            }
        }
        blockers
    }

    /// Replace the collection with a previously checkpointed copy
    /// (session reset support). The restore is itself a state change, so
    /// the version keeps increasing.
    pub fn restore_items(&mut self, items: Vec<DeadstockItem>) {
        self.items = items;
        self.version += 1;
    }

    fn ensure_site(&self, site_id: SiteId) -> Result<(), DomainError> {
        if !self.loaded {
            return Ok(());
        }
        if self.site_id != Some(site_id) {
            return Err(DomainError::invariant("site mismatch"));
        }
        Ok(())
    }

    fn ensure_review_id(&self, review_id: ReviewId) -> Result<(), DomainError> {
        if self.id != review_id {
            return Err(DomainError::invariant("review_id mismatch"));
        }
        Ok(())
    }

    fn ensure_loaded(&self) -> Result<(), DomainError> {
        if !self.loaded {
            return Err(DomainError::not_found());
        }
        Ok(())
    }

    fn ensure_collection_open(&self) -> Result<(), DomainError> {
        if self.is_locked() {
            return Err(DomainError::locked(
                "final approval received; the collection is locked",
            ));
        }
        Ok(())
    }

    fn find_item(&self, item_id: ItemId) -> Result<&DeadstockItem, DomainError> {
        self.item(item_id).ok_or(DomainError::NotFound)
    }

    fn editable_item(&self, item_id: ItemId) -> Result<&DeadstockItem, DomainError> {
        let item = self.find_item(item_id)?;
        if item.is_locked() {
            return Err(DomainError::locked(format!(
                "item {} has received final approval",
                item.item_id()
            )));
        }
        Ok(item)
    }

    fn item_mut(&mut self, item_id: ItemId) -> Option<&mut DeadstockItem> {
        self.items.iter_mut().find(|item| item.item_id() == item_id)
    }

    /// Lines the given actor may touch in a bulk operation: the
    /// representative only reaches lines the customer has not advanced yet.
    fn bulk_eligible(&self, actor: Role) -> impl Iterator<Item = &DeadstockItem> {
        self.items.iter().filter(move |item| match actor {
            Role::Customer => true,
            Role::Representative => item.status() == ItemStatus::AwaitingCustomerAction,
        })
    }

    fn handle_load(&self, cmd: &LoadSnapshot) -> Result<Vec<ReviewEvent>, DomainError> {
        if self.loaded {
            return Err(DomainError::conflict("snapshot already loaded"));
        }
        if cmd.items.is_empty() {
            return Err(DomainError::validation("snapshot contains no items"));
        }

        let mut seen = Vec::with_capacity(cmd.items.len());
        for snapshot in &cmd.items {
            snapshot.validate()?;
            if seen.contains(&snapshot.item_id) {
                return Err(DomainError::validation(format!(
                    "duplicate item {} in snapshot",
                    snapshot.item_id
                )));
            }
            seen.push(snapshot.item_id);
        }

        Ok(vec![ReviewEvent::SnapshotLoaded(SnapshotLoaded {
            site_id: cmd.site_id,
            review_id: cmd.review_id,
            items: cmd.items.clone(),
            occurred_at: cmd.occurred_at,
        })])
    }

    fn handle_set_disposition(&self, cmd: &SetDisposition) -> Result<Vec<ReviewEvent>, DomainError> {
        self.ensure_loaded()?;
        self.ensure_site(cmd.site_id)?;
        self.ensure_review_id(cmd.review_id)?;
        let item = self.editable_item(cmd.item_id)?;

        if cmd.actor == Role::Representative && item.status() != ItemStatus::AwaitingCustomerAction
        {
            return Err(DomainError::locked(format!(
                "customer decision already in progress for item {}",
                item.item_id()
            )));
        }

        let (qty_to_bill, qty_removed) = disposition::decide_quantities(item, cmd.disposition)?;

        Ok(vec![ReviewEvent::DispositionChanged(DispositionChanged {
            site_id: cmd.site_id,
            review_id: cmd.review_id,
            item_id: cmd.item_id,
            disposition: cmd.disposition,
            qty_to_bill,
            qty_removed,
            occurred_at: cmd.occurred_at,
        })])
    }

    fn handle_set_quantity(&self, cmd: &SetQuantity) -> Result<Vec<ReviewEvent>, DomainError> {
        self.ensure_loaded()?;
        self.ensure_site(cmd.site_id)?;
        self.ensure_review_id(cmd.review_id)?;
        let item = self.editable_item(cmd.item_id)?;

        let value = match cmd.field {
            QuantityField::ToBill => {
                if !item.disposition().is_some_and(Disposition::allows_bill_edit) {
                    return Err(DomainError::invariant(
                        "quantity to bill is only editable for invoice-partial items",
                    ));
                }
                item.packaging().snap_qty_to_bill(cmd.raw)?
            }
            QuantityField::Removed => {
                if cmd.actor != Role::Representative {
                    return Err(DomainError::Unauthorized);
                }
                if !item.disposition().is_some_and(Disposition::allows_removed_edit) {
                    return Err(DomainError::invariant(
                        "removed quantity is not editable for this disposition",
                    ));
                }
                item.packaging().snap_qty_removed(cmd.raw, item.qty_to_bill())?
            }
            QuantityField::MinLevel | QuantityField::MaxLevel => {
                if cmd.raw < 0 {
                    return Err(DomainError::validation("stock levels cannot be negative"));
                }
                if !item.is_restockable() {
                    return Err(DomainError::invariant(
                        "stock levels apply to restockable items only",
                    ));
                }
                let (min, max) = match cmd.field {
                    QuantityField::MinLevel => (Some(cmd.raw), item.max_level()),
                    _ => (item.min_level(), Some(cmd.raw)),
                };
                if let (Some(min), Some(max)) = (min, max) {
                    if min > max {
                        return Err(DomainError::validation("min_level exceeds max_level"));
                    }
                }
                cmd.raw
            }
        };

        Ok(vec![ReviewEvent::QuantityChanged(QuantityChanged {
            site_id: cmd.site_id,
            review_id: cmd.review_id,
            item_id: cmd.item_id,
            field: cmd.field,
            value,
            occurred_at: cmd.occurred_at,
        })])
    }

    fn handle_set_unreturnable_reason(
        &self,
        cmd: &SetUnreturnableReason,
    ) -> Result<Vec<ReviewEvent>, DomainError> {
        self.ensure_loaded()?;
        self.ensure_site(cmd.site_id)?;
        self.ensure_review_id(cmd.review_id)?;
        if cmd.actor != Role::Representative {
            return Err(DomainError::Unauthorized);
        }
        let item = self.editable_item(cmd.item_id)?;

        if cmd.reason.is_some() && !item.has_removal_shortfall() {
            return Err(DomainError::invariant(
                "no removal shortfall to explain on this item",
            ));
        }

        Ok(vec![ReviewEvent::UnreturnableReasonChanged(
            UnreturnableReasonChanged {
                site_id: cmd.site_id,
                review_id: cmd.review_id,
                item_id: cmd.item_id,
                reason: cmd.reason.clone(),
                occurred_at: cmd.occurred_at,
            },
        )])
    }

    fn handle_toggle_restockable(
        &self,
        cmd: &ToggleRestockable,
    ) -> Result<Vec<ReviewEvent>, DomainError> {
        self.ensure_loaded()?;
        self.ensure_site(cmd.site_id)?;
        self.ensure_review_id(cmd.review_id)?;
        let item = self.editable_item(cmd.item_id)?;

        Ok(vec![ReviewEvent::RestockableChanged(RestockableChanged {
            site_id: cmd.site_id,
            review_id: cmd.review_id,
            item_id: cmd.item_id,
            restockable: !item.is_restockable(),
            occurred_at: cmd.occurred_at,
        })])
    }

    fn handle_bulk_set_disposition(
        &self,
        cmd: &BulkSetDisposition,
    ) -> Result<Vec<ReviewEvent>, DomainError> {
        self.ensure_loaded()?;
        self.ensure_site(cmd.site_id)?;
        self.ensure_review_id(cmd.review_id)?;
        self.ensure_collection_open()?;

        let mut events = Vec::new();
        for item in self.bulk_eligible(cmd.actor) {
            let (qty_to_bill, qty_removed) =
                disposition::decide_quantities(item, Some(cmd.disposition))?;
            events.push(ReviewEvent::DispositionChanged(DispositionChanged {
                site_id: cmd.site_id,
                review_id: cmd.review_id,
                item_id: item.item_id(),
                disposition: Some(cmd.disposition),
                qty_to_bill,
                qty_removed,
                occurred_at: cmd.occurred_at,
            }));
        }
        Ok(events)
    }

    fn handle_bulk_clear_dispositions(
        &self,
        cmd: &BulkClearDispositions,
    ) -> Result<Vec<ReviewEvent>, DomainError> {
        self.ensure_loaded()?;
        self.ensure_site(cmd.site_id)?;
        self.ensure_review_id(cmd.review_id)?;
        self.ensure_collection_open()?;

        let mut events = Vec::new();
        for item in self.bulk_eligible(cmd.actor) {
            if item.disposition().is_none() {
                continue;
            }
            let (qty_to_bill, qty_removed) = disposition::decide_quantities(item, None)?;
            events.push(ReviewEvent::DispositionChanged(DispositionChanged {
                site_id: cmd.site_id,
                review_id: cmd.review_id,
                item_id: item.item_id(),
                disposition: None,
                qty_to_bill,
                qty_removed,
                occurred_at: cmd.occurred_at,
            }));
        }
        Ok(events)
    }

    fn handle_bulk_set_restockable(
        &self,
        cmd: &BulkSetRestockable,
    ) -> Result<Vec<ReviewEvent>, DomainError> {
        self.ensure_loaded()?;
        self.ensure_site(cmd.site_id)?;
        self.ensure_review_id(cmd.review_id)?;
        self.ensure_collection_open()?;

        let events = self
            .bulk_eligible(cmd.actor)
            .filter(|item| item.is_restockable() != cmd.restockable)
            .map(|item| {
                ReviewEvent::RestockableChanged(RestockableChanged {
                    site_id: cmd.site_id,
                    review_id: cmd.review_id,
                    item_id: item.item_id(),
                    restockable: cmd.restockable,
                    occurred_at: cmd.occurred_at,
                })
            })
            .collect();
        Ok(events)
    }

    fn handle_finalize(&self, cmd: &Finalize) -> Result<Vec<ReviewEvent>, DomainError> {
        self.ensure_loaded()?;
        self.ensure_site(cmd.site_id)?;
        self.ensure_review_id(cmd.review_id)?;
        self.ensure_collection_open()?;

        let blockers = self.finalize_blockers(cmd.actor);
        if !blockers.is_clean() {
            return Err(DomainError::validation(format!(
                "finalize blocked: {} missing dispositions, {} no-op partials, {} unexplained shortfalls",
                blockers.missing_disposition.len(),
                blockers.full_bill_partials.len(),
                blockers.unexplained_shortfalls.len(),
            )));
        }

        let mut events = Vec::new();
        // Partial lines keeping nothing beyond the broken-package minimum
        // are really returns.
        for item in &self.items {
            let min_keep = item.packaging().broken_package_minimum();
            if item.disposition() == Some(Disposition::InvoicePartial)
                && item.qty_to_bill() == min_keep
                && item.qty_to_bill() < item.qty_on_hand()
            {
                let (qty_to_bill, qty_removed) =
                    disposition::decide_quantities(item, Some(Disposition::Return))?;
                events.push(ReviewEvent::DispositionChanged(DispositionChanged {
                    site_id: cmd.site_id,
                    review_id: cmd.review_id,
                    item_id: item.item_id(),
                    disposition: Some(Disposition::Return),
                    qty_to_bill,
                    qty_removed,
                    occurred_at: cmd.occurred_at,
                }));
            }
        }

        events.push(ReviewEvent::ReviewFinalized(ReviewFinalized {
            site_id: cmd.site_id,
            review_id: cmd.review_id,
            actor: cmd.actor,
            occurred_at: cmd.occurred_at,
        }));
        Ok(events)
    }

    fn handle_convert_full_bill_partials(
        &self,
        cmd: &ConvertFullBillPartials,
    ) -> Result<Vec<ReviewEvent>, DomainError> {
        self.ensure_loaded()?;
        self.ensure_site(cmd.site_id)?;
        self.ensure_review_id(cmd.review_id)?;
        self.ensure_collection_open()?;

        let mut events = Vec::new();
        for item in &self.items {
            if item.disposition() == Some(Disposition::InvoicePartial)
                && item.qty_to_bill() == item.qty_on_hand()
            {
                let (qty_to_bill, qty_removed) =
                    disposition::decide_quantities(item, Some(Disposition::InvoiceAll))?;
                events.push(ReviewEvent::DispositionChanged(DispositionChanged {
                    site_id: cmd.site_id,
                    review_id: cmd.review_id,
                    item_id: item.item_id(),
                    disposition: Some(Disposition::InvoiceAll),
                    qty_to_bill,
                    qty_removed,
                    occurred_at: cmd.occurred_at,
                }));
            }
        }
        Ok(events)
    }

    fn handle_submit_final_approval(
        &self,
        cmd: &SubmitFinalApproval,
    ) -> Result<Vec<ReviewEvent>, DomainError> {
        self.ensure_loaded()?;
        self.ensure_site(cmd.site_id)?;
        self.ensure_review_id(cmd.review_id)?;
        if cmd.actor != Role::Customer {
            return Err(DomainError::Unauthorized);
        }
        self.ensure_collection_open()?;

        let not_ready = self
            .items
            .iter()
            .filter(|item| item.status() != ItemStatus::PendingCustomerFinalApproval)
            .count();
        if not_ready > 0 {
            return Err(DomainError::validation(format!(
                "final approval requires every item pending customer approval ({not_ready} not ready)"
            )));
        }

        Ok(vec![ReviewEvent::FinalApprovalReceived(
            FinalApprovalReceived {
                site_id: cmd.site_id,
                review_id: cmd.review_id,
                po_number: cmd.po_number.clone(),
                occurred_at: cmd.occurred_at,
            },
        )])
    }
}

impl AggregateRoot for DeadstockReview {
    type Id = ReviewId;

    fn id(&self) -> &Self::Id {
        &self.id
    }

    fn version(&self) -> u64 {
        self.version
    }
}

impl Aggregate for DeadstockReview {
    type Command = ReviewCommand;
    type Event = ReviewEvent;
    type Error = DomainError;

    fn apply(&mut self, event: &Self::Event) {
        match event {
            ReviewEvent::SnapshotLoaded(e) => {
                self.id = e.review_id;
                self.site_id = Some(e.site_id);
                self.items = e
                    .items
                    .iter()
                    .cloned()
                    .map(DeadstockItem::from_snapshot)
                    .collect();
                self.po_number = None;
                self.last_finalized_at = None;
                self.loaded = true;
            }
            ReviewEvent::DispositionChanged(e) => {
                if let Some(item) = self.item_mut(e.item_id) {
                    item.apply_disposition(e.disposition, e.qty_to_bill, e.qty_removed);
                }
            }
            ReviewEvent::QuantityChanged(e) => {
                if let Some(item) = self.item_mut(e.item_id) {
                    match e.field {
                        QuantityField::ToBill => item.apply_qty_to_bill(e.value),
                        QuantityField::Removed => item.apply_qty_removed(e.value),
                        QuantityField::MinLevel => item.apply_min_level(e.value),
                        QuantityField::MaxLevel => item.apply_max_level(e.value),
                    }
                }
            }
            ReviewEvent::UnreturnableReasonChanged(e) => {
                if let Some(item) = self.item_mut(e.item_id) {
                    item.apply_unreturnable_reason(e.reason.clone());
                }
            }
            ReviewEvent::RestockableChanged(e) => {
                if let Some(item) = self.item_mut(e.item_id) {
                    item.apply_restockable(e.restockable);
                }
            }
            ReviewEvent::ReviewFinalized(e) => {
                self.last_finalized_at = Some(e.occurred_at);
            }
            ReviewEvent::FinalApprovalReceived(e) => {
                self.po_number = e.po_number.clone();
                for item in &mut self.items {
                    item.mark_final_approved();
                }
            }
        }

        // Deterministic version tracking: +1 per applied event.
        self.version += 1;
    }

    fn handle(&self, command: &Self::Command) -> Result<Vec<Self::Event>, Self::Error> {
        match command {
            ReviewCommand::LoadSnapshot(cmd) => self.handle_load(cmd),
            ReviewCommand::SetDisposition(cmd) => self.handle_set_disposition(cmd),
            ReviewCommand::SetQuantity(cmd) => self.handle_set_quantity(cmd),
            ReviewCommand::SetUnreturnableReason(cmd) => self.handle_set_unreturnable_reason(cmd),
            ReviewCommand::ToggleRestockable(cmd) => self.handle_toggle_restockable(cmd),
            ReviewCommand::BulkSetDisposition(cmd) => self.handle_bulk_set_disposition(cmd),
            ReviewCommand::BulkClearDispositions(cmd) => self.handle_bulk_clear_dispositions(cmd),
            ReviewCommand::BulkSetRestockable(cmd) => self.handle_bulk_set_restockable(cmd),
            ReviewCommand::Finalize(cmd) => self.handle_finalize(cmd),
            ReviewCommand::ConvertFullBillPartials(cmd) => {
                self.handle_convert_full_bill_partials(cmd)
            }
            ReviewCommand::SubmitFinalApproval(cmd) => self.handle_submit_final_approval(cmd),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use deadstock_core::StockManagementId;
    use deadstock_events::execute;

    fn test_site_id() -> SiteId {
        SiteId::new(26)
    }

    fn test_review_id() -> ReviewId {
        ReviewId::new(AggregateId::new())
    }

    fn test_time() -> DateTime<Utc> {
        Utc::now()
    }

    fn snapshot(item_id: i64, qty_on_hand: i64, package_size: i64) -> ItemSnapshot {
        ItemSnapshot {
            item_id: ItemId::new(item_id),
            stock_management_id: StockManagementId::new(item_id + 10_000),
            part_number: format!("PN-{item_id}"),
            description: "EM 1/16 X 1/4 CRBD 4FL SQ".to_string(),
            location_name: "CONSIGN MAXI".to_string(),
            supplier_name: "PTSOLUTIONS".to_string(),
            last_issue_date: None,
            qty_on_hand,
            package_size,
            unit_price_cents: 1481,
            is_restockable: true,
            min_level: Some(2),
            max_level: Some(11),
        }
    }

    fn loaded_review(snapshots: Vec<ItemSnapshot>) -> (DeadstockReview, SiteId, ReviewId) {
        let site_id = test_site_id();
        let review_id = test_review_id();
        let mut review = DeadstockReview::empty(review_id);
        let cmd = ReviewCommand::LoadSnapshot(LoadSnapshot {
            site_id,
            review_id,
            items: snapshots,
            occurred_at: test_time(),
        });
        execute(&mut review, &cmd).unwrap();
        (review, site_id, review_id)
    }

    fn set_disposition(
        review: &mut DeadstockReview,
        site_id: SiteId,
        review_id: ReviewId,
        actor: Role,
        item_id: i64,
        disposition: Option<Disposition>,
    ) -> Result<Vec<ReviewEvent>, DomainError> {
        execute(
            review,
            &ReviewCommand::SetDisposition(SetDisposition {
                site_id,
                review_id,
                actor,
                item_id: ItemId::new(item_id),
                disposition,
                occurred_at: test_time(),
            }),
        )
    }

    fn set_quantity(
        review: &mut DeadstockReview,
        site_id: SiteId,
        review_id: ReviewId,
        actor: Role,
        item_id: i64,
        field: QuantityField,
        raw: i64,
    ) -> Result<Vec<ReviewEvent>, DomainError> {
        execute(
            review,
            &ReviewCommand::SetQuantity(SetQuantity {
                site_id,
                review_id,
                actor,
                item_id: ItemId::new(item_id),
                field,
                raw,
                occurred_at: test_time(),
            }),
        )
    }

    fn item(review: &DeadstockReview, item_id: i64) -> &DeadstockItem {
        review.item(ItemId::new(item_id)).unwrap()
    }

    #[test]
    fn load_snapshot_creates_undecided_lines() {
        let (review, _, _) = loaded_review(vec![snapshot(1, 20, 1), snapshot(2, 24, 10)]);

        assert_eq!(review.items().len(), 2);
        assert_eq!(review.version(), 1);
        assert!(review.is_loaded());

        let line = item(&review, 2);
        assert_eq!(line.disposition(), None);
        assert_eq!(line.qty_to_bill(), 24);
        assert_eq!(line.qty_to_remove(), 0);
        assert_eq!(line.status(), ItemStatus::AwaitingCustomerAction);
    }

    #[test]
    fn load_rejects_empty_and_duplicate_snapshots() {
        let review = DeadstockReview::empty(test_review_id());

        let empty = ReviewCommand::LoadSnapshot(LoadSnapshot {
            site_id: test_site_id(),
            review_id: review.id_typed(),
            items: Vec::new(),
            occurred_at: test_time(),
        });
        assert!(matches!(
            review.handle(&empty).unwrap_err(),
            DomainError::Validation(_)
        ));

        let duplicated = ReviewCommand::LoadSnapshot(LoadSnapshot {
            site_id: test_site_id(),
            review_id: review.id_typed(),
            items: vec![snapshot(1, 5, 1), snapshot(1, 5, 1)],
            occurred_at: test_time(),
        });
        assert!(matches!(
            review.handle(&duplicated).unwrap_err(),
            DomainError::Validation(_)
        ));
    }

    #[test]
    fn invoice_all_settles_quantities_and_skips_verification() {
        let (mut review, site_id, review_id) = loaded_review(vec![snapshot(1, 10, 1)]);
        set_disposition(
            &mut review,
            site_id,
            review_id,
            Role::Customer,
            1,
            Some(Disposition::InvoiceAll),
        )
        .unwrap();

        let line = item(&review, 1);
        assert_eq!(line.qty_to_bill(), 10);
        assert_eq!(line.qty_removed(), Some(0));
        assert_eq!(line.qty_to_remove(), 0);
        assert_eq!(line.qty_unreturnable(), Some(0));
        assert_eq!(line.status(), ItemStatus::PendingCustomerFinalApproval);
    }

    #[test]
    fn return_bills_only_the_broken_package_minimum() {
        let (mut review, site_id, review_id) = loaded_review(vec![snapshot(1, 24, 10)]);
        set_disposition(
            &mut review,
            site_id,
            review_id,
            Role::Customer,
            1,
            Some(Disposition::Return),
        )
        .unwrap();

        let line = item(&review, 1);
        assert_eq!(line.qty_to_bill(), 4);
        assert_eq!(line.qty_to_remove(), 20);
        assert_eq!(line.status(), ItemStatus::PendingStockVerification);
    }

    #[test]
    fn partial_snaps_edited_bill_quantity() {
        let (mut review, site_id, review_id) = loaded_review(vec![snapshot(1, 24, 10)]);
        set_disposition(
            &mut review,
            site_id,
            review_id,
            Role::Customer,
            1,
            Some(Disposition::InvoicePartial),
        )
        .unwrap();

        // Valid values are 4, 14, 24; 15 snaps to 14.
        set_quantity(
            &mut review,
            site_id,
            review_id,
            Role::Customer,
            1,
            QuantityField::ToBill,
            15,
        )
        .unwrap();

        let line = item(&review, 1);
        assert_eq!(line.qty_to_bill(), 14);
        assert_eq!(line.qty_to_remove(), 10);
    }

    #[test]
    fn negative_quantity_input_rejected_and_state_unchanged() {
        let (mut review, site_id, review_id) = loaded_review(vec![snapshot(1, 24, 10)]);
        set_disposition(
            &mut review,
            site_id,
            review_id,
            Role::Customer,
            1,
            Some(Disposition::InvoicePartial),
        )
        .unwrap();
        let before = item(&review, 1).clone();

        let err = set_quantity(
            &mut review,
            site_id,
            review_id,
            Role::Customer,
            1,
            QuantityField::ToBill,
            -3,
        )
        .unwrap_err();

        assert!(matches!(err, DomainError::Validation(_)));
        assert_eq!(item(&review, 1), &before);
    }

    #[test]
    fn bill_is_only_editable_for_partial_lines() {
        let (mut review, site_id, review_id) = loaded_review(vec![snapshot(1, 10, 1)]);
        set_disposition(
            &mut review,
            site_id,
            review_id,
            Role::Customer,
            1,
            Some(Disposition::InvoiceAll),
        )
        .unwrap();

        let err = set_quantity(
            &mut review,
            site_id,
            review_id,
            Role::Customer,
            1,
            QuantityField::ToBill,
            5,
        )
        .unwrap_err();
        assert!(matches!(err, DomainError::InvariantViolation(_)));
    }

    #[test]
    fn removed_quantity_requires_the_representative() {
        let (mut review, site_id, review_id) = loaded_review(vec![snapshot(1, 24, 10)]);
        set_disposition(
            &mut review,
            site_id,
            review_id,
            Role::Customer,
            1,
            Some(Disposition::Return),
        )
        .unwrap();

        let err = set_quantity(
            &mut review,
            site_id,
            review_id,
            Role::Customer,
            1,
            QuantityField::Removed,
            10,
        )
        .unwrap_err();
        assert_eq!(err, DomainError::Unauthorized);
    }

    #[test]
    fn removed_quantity_snaps_to_whole_packages() {
        let (mut review, site_id, review_id) = loaded_review(vec![snapshot(1, 24, 10)]);
        set_disposition(
            &mut review,
            site_id,
            review_id,
            Role::Customer,
            1,
            Some(Disposition::Return),
        )
        .unwrap();

        set_quantity(
            &mut review,
            site_id,
            review_id,
            Role::Representative,
            1,
            QuantityField::Removed,
            7,
        )
        .unwrap();

        let line = item(&review, 1);
        assert_eq!(line.qty_removed(), Some(10));
        assert_eq!(line.qty_unreturnable(), Some(10));
        // Shortfall without a reason: still pending verification.
        assert_eq!(line.status(), ItemStatus::PendingStockVerification);
    }

    #[test]
    fn full_removal_advances_to_pending_approval() {
        let (mut review, site_id, review_id) = loaded_review(vec![snapshot(1, 24, 10)]);
        set_disposition(
            &mut review,
            site_id,
            review_id,
            Role::Customer,
            1,
            Some(Disposition::Return),
        )
        .unwrap();

        set_quantity(
            &mut review,
            site_id,
            review_id,
            Role::Representative,
            1,
            QuantityField::Removed,
            20,
        )
        .unwrap();

        let line = item(&review, 1);
        assert_eq!(line.qty_removed(), Some(20));
        assert_eq!(line.qty_unreturnable(), Some(0));
        assert_eq!(line.status(), ItemStatus::PendingCustomerFinalApproval);
    }

    #[test]
    fn explained_shortfall_advances_to_pending_approval() {
        let (mut review, site_id, review_id) = loaded_review(vec![snapshot(1, 24, 10)]);
        set_disposition(
            &mut review,
            site_id,
            review_id,
            Role::Customer,
            1,
            Some(Disposition::Return),
        )
        .unwrap();
        set_quantity(
            &mut review,
            site_id,
            review_id,
            Role::Representative,
            1,
            QuantityField::Removed,
            10,
        )
        .unwrap();
        assert_eq!(item(&review, 1).status(), ItemStatus::PendingStockVerification);

        execute(
            &mut review,
            &ReviewCommand::SetUnreturnableReason(SetUnreturnableReason {
                site_id,
                review_id,
                actor: Role::Representative,
                item_id: ItemId::new(1),
                reason: Some(UnreturnableReason::Damaged),
                occurred_at: test_time(),
            }),
        )
        .unwrap();

        assert_eq!(
            item(&review, 1).status(),
            ItemStatus::PendingCustomerFinalApproval
        );
    }

    #[test]
    fn reason_requires_an_open_shortfall() {
        let (mut review, site_id, review_id) = loaded_review(vec![snapshot(1, 24, 10)]);
        set_disposition(
            &mut review,
            site_id,
            review_id,
            Role::Customer,
            1,
            Some(Disposition::Return),
        )
        .unwrap();

        let err = review
            .handle(&ReviewCommand::SetUnreturnableReason(SetUnreturnableReason {
                site_id,
                review_id,
                actor: Role::Representative,
                item_id: ItemId::new(1),
                reason: Some(UnreturnableReason::Missing),
                occurred_at: test_time(),
            }))
            .unwrap_err();
        assert!(matches!(err, DomainError::InvariantViolation(_)));
    }

    #[test]
    fn clearing_the_disposition_resets_the_line() {
        let (mut review, site_id, review_id) = loaded_review(vec![snapshot(1, 24, 10)]);
        set_disposition(
            &mut review,
            site_id,
            review_id,
            Role::Customer,
            1,
            Some(Disposition::Return),
        )
        .unwrap();
        assert_eq!(item(&review, 1).status(), ItemStatus::PendingStockVerification);

        set_disposition(&mut review, site_id, review_id, Role::Customer, 1, None).unwrap();

        let line = item(&review, 1);
        assert_eq!(line.disposition(), None);
        assert_eq!(line.qty_to_bill(), 24);
        assert_eq!(line.status(), ItemStatus::AwaitingCustomerAction);
    }

    #[test]
    fn disposition_round_trip_matches_single_set() {
        let (mut review, site_id, review_id) = loaded_review(vec![snapshot(1, 24, 10)]);
        set_disposition(
            &mut review,
            site_id,
            review_id,
            Role::Customer,
            1,
            Some(Disposition::InvoiceAll),
        )
        .unwrap();
        set_disposition(
            &mut review,
            site_id,
            review_id,
            Role::Customer,
            1,
            Some(Disposition::Return),
        )
        .unwrap();
        set_disposition(
            &mut review,
            site_id,
            review_id,
            Role::Customer,
            1,
            Some(Disposition::InvoiceAll),
        )
        .unwrap();

        let (mut once, site_id2, review_id2) = loaded_review(vec![snapshot(1, 24, 10)]);
        set_disposition(
            &mut once,
            site_id2,
            review_id2,
            Role::Customer,
            1,
            Some(Disposition::InvoiceAll),
        )
        .unwrap();

        assert_eq!(item(&review, 1), item(&once, 1));
    }

    #[test]
    fn representative_cannot_override_a_customer_decision() {
        let (mut review, site_id, review_id) = loaded_review(vec![snapshot(1, 24, 10)]);
        set_disposition(
            &mut review,
            site_id,
            review_id,
            Role::Customer,
            1,
            Some(Disposition::Return),
        )
        .unwrap();

        let err = set_disposition(
            &mut review,
            site_id,
            review_id,
            Role::Representative,
            1,
            Some(Disposition::InvoiceAll),
        )
        .unwrap_err();
        assert!(matches!(err, DomainError::Locked(_)));
    }

    #[test]
    fn bulk_disposition_skips_advanced_lines_for_the_representative() {
        let (mut review, site_id, review_id) = loaded_review(vec![
            snapshot(1, 10, 1),
            snapshot(2, 24, 10),
            snapshot(3, 8, 1),
        ]);
        set_disposition(
            &mut review,
            site_id,
            review_id,
            Role::Customer,
            2,
            Some(Disposition::Return),
        )
        .unwrap();

        let events = execute(
            &mut review,
            &ReviewCommand::BulkSetDisposition(BulkSetDisposition {
                site_id,
                review_id,
                actor: Role::Representative,
                disposition: Disposition::InvoiceAll,
                occurred_at: test_time(),
            }),
        )
        .unwrap();

        assert_eq!(events.len(), 2);
        assert_eq!(item(&review, 1).disposition(), Some(Disposition::InvoiceAll));
        assert_eq!(item(&review, 2).disposition(), Some(Disposition::Return));
        assert_eq!(item(&review, 3).disposition(), Some(Disposition::InvoiceAll));
    }

    #[test]
    fn bulk_clear_skips_undecided_lines() {
        let (mut review, site_id, review_id) =
            loaded_review(vec![snapshot(1, 10, 1), snapshot(2, 8, 1)]);
        set_disposition(
            &mut review,
            site_id,
            review_id,
            Role::Customer,
            1,
            Some(Disposition::InvoiceAll),
        )
        .unwrap();

        let events = execute(
            &mut review,
            &ReviewCommand::BulkClearDispositions(BulkClearDispositions {
                site_id,
                review_id,
                actor: Role::Customer,
                occurred_at: test_time(),
            }),
        )
        .unwrap();

        assert_eq!(events.len(), 1);
        assert_eq!(item(&review, 1).disposition(), None);
        assert_eq!(item(&review, 1).status(), ItemStatus::AwaitingCustomerAction);
    }

    #[test]
    fn bulk_restockable_skips_lines_already_at_target() {
        let (mut review, site_id, review_id) =
            loaded_review(vec![snapshot(1, 10, 1), snapshot(2, 8, 1)]);
        execute(
            &mut review,
            &ReviewCommand::ToggleRestockable(ToggleRestockable {
                site_id,
                review_id,
                actor: Role::Customer,
                item_id: ItemId::new(1),
                occurred_at: test_time(),
            }),
        )
        .unwrap();
        assert!(!item(&review, 1).is_restockable());

        let events = execute(
            &mut review,
            &ReviewCommand::BulkSetRestockable(BulkSetRestockable {
                site_id,
                review_id,
                actor: Role::Customer,
                restockable: false,
                occurred_at: test_time(),
            }),
        )
        .unwrap();

        assert_eq!(events.len(), 1);
        assert!(!item(&review, 2).is_restockable());
    }

    #[test]
    fn turning_restockable_off_clears_levels() {
        let (mut review, site_id, review_id) = loaded_review(vec![snapshot(1, 10, 1)]);
        assert_eq!(item(&review, 1).min_level(), Some(2));

        execute(
            &mut review,
            &ReviewCommand::ToggleRestockable(ToggleRestockable {
                site_id,
                review_id,
                actor: Role::Customer,
                item_id: ItemId::new(1),
                occurred_at: test_time(),
            }),
        )
        .unwrap();

        let line = item(&review, 1);
        assert!(!line.is_restockable());
        assert_eq!(line.min_level(), None);
        assert_eq!(line.max_level(), None);
    }

    #[test]
    fn level_edits_require_a_restockable_line() {
        let (mut review, site_id, review_id) = loaded_review(vec![snapshot(1, 10, 1)]);
        execute(
            &mut review,
            &ReviewCommand::ToggleRestockable(ToggleRestockable {
                site_id,
                review_id,
                actor: Role::Customer,
                item_id: ItemId::new(1),
                occurred_at: test_time(),
            }),
        )
        .unwrap();

        let err = set_quantity(
            &mut review,
            site_id,
            review_id,
            Role::Customer,
            1,
            QuantityField::MinLevel,
            3,
        )
        .unwrap_err();
        assert!(matches!(err, DomainError::InvariantViolation(_)));
    }

    #[test]
    fn level_edits_keep_min_below_max() {
        let (mut review, site_id, review_id) = loaded_review(vec![snapshot(1, 10, 1)]);

        let err = set_quantity(
            &mut review,
            site_id,
            review_id,
            Role::Customer,
            1,
            QuantityField::MinLevel,
            15,
        )
        .unwrap_err();
        assert!(matches!(err, DomainError::Validation(_)));

        set_quantity(
            &mut review,
            site_id,
            review_id,
            Role::Customer,
            1,
            QuantityField::MaxLevel,
            20,
        )
        .unwrap();
        set_quantity(
            &mut review,
            site_id,
            review_id,
            Role::Customer,
            1,
            QuantityField::MinLevel,
            15,
        )
        .unwrap();
        assert_eq!(item(&review, 1).min_level(), Some(15));
        assert_eq!(item(&review, 1).max_level(), Some(20));
    }

    #[test]
    fn finalize_rejects_missing_dispositions() {
        let (review, site_id, review_id) =
            loaded_review(vec![snapshot(1, 10, 1), snapshot(2, 8, 1)]);

        let err = review
            .handle(&ReviewCommand::Finalize(Finalize {
                site_id,
                review_id,
                actor: Role::Customer,
                occurred_at: test_time(),
            }))
            .unwrap_err();

        match err {
            DomainError::Validation(msg) => assert!(msg.contains("2 missing dispositions")),
            other => panic!("expected validation rejection, got {other:?}"),
        }
        assert_eq!(
            review.finalize_blockers(Role::Customer).missing_disposition.len(),
            2
        );
    }

    #[test]
    fn finalize_flags_noop_partials_and_convert_rewrites_them() {
        let (mut review, site_id, review_id) = loaded_review(vec![snapshot(1, 24, 10)]);
        // Partial with the default (full) billable quantity: nothing is
        // actually returned.
        set_disposition(
            &mut review,
            site_id,
            review_id,
            Role::Customer,
            1,
            Some(Disposition::InvoicePartial),
        )
        .unwrap();

        let err = review
            .handle(&ReviewCommand::Finalize(Finalize {
                site_id,
                review_id,
                actor: Role::Customer,
                occurred_at: test_time(),
            }))
            .unwrap_err();
        match err {
            DomainError::Validation(msg) => assert!(msg.contains("1 no-op partials")),
            other => panic!("expected validation rejection, got {other:?}"),
        }

        execute(
            &mut review,
            &ReviewCommand::ConvertFullBillPartials(ConvertFullBillPartials {
                site_id,
                review_id,
                actor: Role::Customer,
                occurred_at: test_time(),
            }),
        )
        .unwrap();
        assert_eq!(item(&review, 1).disposition(), Some(Disposition::InvoiceAll));

        execute(
            &mut review,
            &ReviewCommand::Finalize(Finalize {
                site_id,
                review_id,
                actor: Role::Customer,
                occurred_at: test_time(),
            }),
        )
        .unwrap();
        assert!(review.last_finalized_at().is_some());
    }

    #[test]
    fn finalize_auto_converts_minimum_partials_to_return() {
        let (mut review, site_id, review_id) = loaded_review(vec![snapshot(1, 24, 10)]);
        set_disposition(
            &mut review,
            site_id,
            review_id,
            Role::Customer,
            1,
            Some(Disposition::InvoicePartial),
        )
        .unwrap();
        // Keep only the broken package: the customer kept nothing optional.
        set_quantity(
            &mut review,
            site_id,
            review_id,
            Role::Customer,
            1,
            QuantityField::ToBill,
            4,
        )
        .unwrap();

        let events = execute(
            &mut review,
            &ReviewCommand::Finalize(Finalize {
                site_id,
                review_id,
                actor: Role::Customer,
                occurred_at: test_time(),
            }),
        )
        .unwrap();

        assert_eq!(events.len(), 2);
        assert_eq!(item(&review, 1).disposition(), Some(Disposition::Return));
        assert_eq!(item(&review, 1).qty_to_bill(), 4);
    }

    #[test]
    fn representative_finalize_requires_explained_shortfalls() {
        let (mut review, site_id, review_id) = loaded_review(vec![snapshot(1, 20, 1)]);
        set_disposition(
            &mut review,
            site_id,
            review_id,
            Role::Customer,
            1,
            Some(Disposition::Return),
        )
        .unwrap();
        set_quantity(
            &mut review,
            site_id,
            review_id,
            Role::Representative,
            1,
            QuantityField::Removed,
            14,
        )
        .unwrap();

        let err = review
            .handle(&ReviewCommand::Finalize(Finalize {
                site_id,
                review_id,
                actor: Role::Representative,
                occurred_at: test_time(),
            }))
            .unwrap_err();
        match err {
            DomainError::Validation(msg) => assert!(msg.contains("1 unexplained shortfalls")),
            other => panic!("expected validation rejection, got {other:?}"),
        }

        // The customer's finalize does not gate on removal verification.
        review
            .handle(&ReviewCommand::Finalize(Finalize {
                site_id,
                review_id,
                actor: Role::Customer,
                occurred_at: test_time(),
            }))
            .unwrap();
    }

    #[test]
    fn final_approval_locks_every_line() {
        let (mut review, site_id, review_id) =
            loaded_review(vec![snapshot(1, 10, 1), snapshot(2, 8, 1)]);
        for id in [1, 2] {
            set_disposition(
                &mut review,
                site_id,
                review_id,
                Role::Customer,
                id,
                Some(Disposition::InvoiceAll),
            )
            .unwrap();
        }

        execute(
            &mut review,
            &ReviewCommand::SubmitFinalApproval(SubmitFinalApproval {
                site_id,
                review_id,
                actor: Role::Customer,
                po_number: Some("PO-88120".to_string()),
                occurred_at: test_time(),
            }),
        )
        .unwrap();

        assert!(review.is_locked());
        assert_eq!(review.po_number(), Some("PO-88120"));
        for line in review.items() {
            assert_eq!(line.status(), ItemStatus::CustomerFinalApprovalReceived);
        }

        // Hard lock: nothing mutates anymore.
        let err = set_disposition(
            &mut review,
            site_id,
            review_id,
            Role::Customer,
            1,
            Some(Disposition::Return),
        )
        .unwrap_err();
        assert!(matches!(err, DomainError::Locked(_)));

        let err = execute(
            &mut review,
            &ReviewCommand::BulkSetDisposition(BulkSetDisposition {
                site_id,
                review_id,
                actor: Role::Customer,
                disposition: Disposition::Return,
                occurred_at: test_time(),
            }),
        )
        .unwrap_err();
        assert!(matches!(err, DomainError::Locked(_)));
    }

    #[test]
    fn final_approval_is_customer_only() {
        let (mut review, site_id, review_id) = loaded_review(vec![snapshot(1, 10, 1)]);
        set_disposition(
            &mut review,
            site_id,
            review_id,
            Role::Customer,
            1,
            Some(Disposition::InvoiceAll),
        )
        .unwrap();

        let err = review
            .handle(&ReviewCommand::SubmitFinalApproval(SubmitFinalApproval {
                site_id,
                review_id,
                actor: Role::Representative,
                po_number: None,
                occurred_at: test_time(),
            }))
            .unwrap_err();
        assert_eq!(err, DomainError::Unauthorized);
    }

    #[test]
    fn final_approval_requires_every_line_ready() {
        let (mut review, site_id, review_id) =
            loaded_review(vec![snapshot(1, 10, 1), snapshot(2, 24, 10)]);
        set_disposition(
            &mut review,
            site_id,
            review_id,
            Role::Customer,
            1,
            Some(Disposition::InvoiceAll),
        )
        .unwrap();
        set_disposition(
            &mut review,
            site_id,
            review_id,
            Role::Customer,
            2,
            Some(Disposition::Return),
        )
        .unwrap();

        let err = review
            .handle(&ReviewCommand::SubmitFinalApproval(SubmitFinalApproval {
                site_id,
                review_id,
                actor: Role::Customer,
                po_number: None,
                occurred_at: test_time(),
            }))
            .unwrap_err();
        match err {
            DomainError::Validation(msg) => assert!(msg.contains("1 not ready")),
            other => panic!("expected validation rejection, got {other:?}"),
        }
    }

    #[test]
    fn version_increments_on_apply() {
        let (mut review, site_id, review_id) = loaded_review(vec![snapshot(1, 10, 1)]);
        assert_eq!(review.version(), 1);

        set_disposition(
            &mut review,
            site_id,
            review_id,
            Role::Customer,
            1,
            Some(Disposition::InvoiceAll),
        )
        .unwrap();
        assert_eq!(review.version(), 2);
    }

    #[test]
    fn handle_does_not_mutate_state() {
        let (review, site_id, review_id) = loaded_review(vec![snapshot(1, 24, 10)]);
        let before = review.clone();

        let cmd = ReviewCommand::SetDisposition(SetDisposition {
            site_id,
            review_id,
            actor: Role::Customer,
            item_id: ItemId::new(1),
            disposition: Some(Disposition::Return),
            occurred_at: test_time(),
        });

        let events1 = review.handle(&cmd).unwrap();
        let events2 = review.handle(&cmd).unwrap();

        assert_eq!(review, before);
        assert_eq!(events1, events2);
    }

    mod proptest_tests {
        use super::*;
        use proptest::prelude::*;

        fn arb_disposition(tag: u8) -> Option<Disposition> {
            match tag % 4 {
                0 => None,
                1 => Some(Disposition::InvoiceAll),
                2 => Some(Disposition::InvoicePartial),
                _ => Some(Disposition::Return),
            }
        }

        proptest! {
            #![proptest_config(ProptestConfig {
                cases: 256,
                ..ProptestConfig::default()
            })]

            /// Property: however the bill quantity is edited, a partial
            /// line stays on the broken-package grid.
            #[test]
            fn partial_bill_edits_stay_on_grid(
                qty_on_hand in 0i64..500,
                package_size in 1i64..40,
                raws in prop::collection::vec(0i64..1_000, 1..8),
            ) {
                let (mut review, site_id, review_id) =
                    loaded_review(vec![snapshot(1, qty_on_hand, package_size)]);
                set_disposition(
                    &mut review,
                    site_id,
                    review_id,
                    Role::Customer,
                    1,
                    Some(Disposition::InvoicePartial),
                )
                .unwrap();

                for raw in raws {
                    set_quantity(
                        &mut review,
                        site_id,
                        review_id,
                        Role::Customer,
                        1,
                        QuantityField::ToBill,
                        raw,
                    )
                    .unwrap();
                }

                let line = item(&review, 1);
                let min_keep = line.packaging().broken_package_minimum();
                prop_assert!(line.qty_to_bill() >= min_keep);
                prop_assert!(line.qty_to_bill() <= qty_on_hand);
                if package_size > 1 {
                    prop_assert_eq!((line.qty_to_bill() - min_keep) % package_size, 0);
                }
                prop_assert_eq!(
                    line.qty_to_remove(),
                    (qty_on_hand - line.qty_to_bill()).max(0)
                );
            }

            /// Property: any disposition history ending in invoice-all is
            /// indistinguishable from choosing invoice-all once.
            #[test]
            fn history_ending_in_invoice_all_is_canonical(
                qty_on_hand in 0i64..500,
                package_size in 1i64..40,
                tags in prop::collection::vec(0u8..4, 0..8),
            ) {
                let (mut review, site_id, review_id) =
                    loaded_review(vec![snapshot(1, qty_on_hand, package_size)]);
                for tag in tags {
                    set_disposition(
                        &mut review,
                        site_id,
                        review_id,
                        Role::Customer,
                        1,
                        arb_disposition(tag),
                    )
                    .unwrap();
                }
                set_disposition(
                    &mut review,
                    site_id,
                    review_id,
                    Role::Customer,
                    1,
                    Some(Disposition::InvoiceAll),
                )
                .unwrap();

                let (mut once, site_id2, review_id2) =
                    loaded_review(vec![snapshot(1, qty_on_hand, package_size)]);
                set_disposition(
                    &mut once,
                    site_id2,
                    review_id2,
                    Role::Customer,
                    1,
                    Some(Disposition::InvoiceAll),
                )
                .unwrap();

                prop_assert_eq!(item(&review, 1), item(&once, 1));
            }

            /// Property: status only moves forward under customer edits,
            /// except the explicit reset when the disposition is cleared.
            #[test]
            fn status_is_forward_only_except_clear(
                qty_on_hand in 0i64..500,
                package_size in 1i64..40,
                tags in prop::collection::vec(0u8..4, 1..10),
            ) {
                let (mut review, site_id, review_id) =
                    loaded_review(vec![snapshot(1, qty_on_hand, package_size)]);
                let mut previous = item(&review, 1).status();

                for tag in tags {
                    let disposition = arb_disposition(tag);
                    set_disposition(
                        &mut review,
                        site_id,
                        review_id,
                        Role::Customer,
                        1,
                        disposition,
                    )
                    .unwrap();
                    let current = item(&review, 1).status();
                    if disposition.is_some() {
                        prop_assert!(current >= previous);
                    } else {
                        prop_assert_eq!(current, ItemStatus::AwaitingCustomerAction);
                    }
                    previous = current;
                }
            }
        }
    }
}
