//! One consignment inventory line under review.

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

use deadstock_core::{DomainError, DomainResult, Entity, ItemId, StockManagementId};

use crate::disposition::Disposition;
use crate::quantity::Packaging;
use crate::status::{self, ItemStatus};

/// Why removed stock fell short of what was staged for removal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UnreturnableReason {
    Damaged,
    Consumed,
    Missing,
    Expired,
    Other(String),
}

/// Upstream snapshot record for one inventory line, as delivered by the
/// stock-management collaborator when a customer's deadstock is loaded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ItemSnapshot {
    pub item_id: ItemId,
    pub stock_management_id: StockManagementId,
    pub part_number: String,
    pub description: String,
    pub location_name: String,
    pub supplier_name: String,
    pub last_issue_date: Option<NaiveDate>,
    pub qty_on_hand: i64,
    pub package_size: i64,
    /// Price in smallest currency unit (e.g., cents).
    pub unit_price_cents: u64,
    pub is_restockable: bool,
    pub min_level: Option<i64>,
    pub max_level: Option<i64>,
}

impl ItemSnapshot {
    /// Validate upstream facts before a snapshot is accepted into a review.
    pub fn validate(&self) -> DomainResult<()> {
        if self.qty_on_hand < 0 {
            return Err(DomainError::validation(format!(
                "item {}: qty_on_hand cannot be negative",
                self.item_id
            )));
        }
        if self.package_size < 1 {
            return Err(DomainError::validation(format!(
                "item {}: package_size must be at least 1",
                self.item_id
            )));
        }
        if self.min_level.is_some_and(|v| v < 0) || self.max_level.is_some_and(|v| v < 0) {
            return Err(DomainError::validation(format!(
                "item {}: stock levels cannot be negative",
                self.item_id
            )));
        }
        if let (Some(min), Some(max)) = (self.min_level, self.max_level) {
            if min > max {
                return Err(DomainError::validation(format!(
                    "item {}: min_level exceeds max_level",
                    self.item_id
                )));
            }
        }
        Ok(())
    }
}

/// Entity: one deadstock line inside a review.
///
/// Facts come from the upstream system and are read-only here; decision
/// fields are mutated by the review aggregate only, which keeps the derived
/// quantities and the status consistent after every change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeadstockItem {
    item_id: ItemId,
    stock_management_id: StockManagementId,
    part_number: String,
    description: String,
    location_name: String,
    supplier_name: String,
    last_issue_date: Option<NaiveDate>,
    packaging: Packaging,
    unit_price_cents: u64,

    disposition: Option<Disposition>,
    qty_to_bill: i64,
    /// `None` means the representative has not recorded a removal yet;
    /// distinct from an explicit zero.
    qty_removed: Option<i64>,
    unreturnable_reason: Option<UnreturnableReason>,
    is_restockable: bool,
    min_level: Option<i64>,
    max_level: Option<i64>,

    qty_to_remove: i64,
    qty_unreturnable: Option<i64>,

    status: ItemStatus,
}

impl DeadstockItem {
    /// Build the initial review line from an upstream snapshot.
    ///
    /// Undecided lines bill the full on-hand quantity (the upstream
    /// default); malformed facts are normalized by `Packaging`.
    pub fn from_snapshot(snapshot: ItemSnapshot) -> Self {
        let packaging = Packaging::new(snapshot.qty_on_hand, snapshot.package_size);
        let (min_level, max_level) = if snapshot.is_restockable {
            (snapshot.min_level, snapshot.max_level)
        } else {
            (None, None)
        };

        let mut item = Self {
            item_id: snapshot.item_id,
            stock_management_id: snapshot.stock_management_id,
            part_number: snapshot.part_number,
            description: snapshot.description,
            location_name: snapshot.location_name,
            supplier_name: snapshot.supplier_name,
            last_issue_date: snapshot.last_issue_date,
            packaging,
            unit_price_cents: snapshot.unit_price_cents,
            disposition: None,
            qty_to_bill: packaging.qty_on_hand(),
            qty_removed: None,
            unreturnable_reason: None,
            is_restockable: snapshot.is_restockable,
            min_level,
            max_level,
            qty_to_remove: 0,
            qty_unreturnable: None,
            status: ItemStatus::AwaitingCustomerAction,
        };
        item.recompute_derived();
        item
    }

    pub fn item_id(&self) -> ItemId {
        self.item_id
    }

    pub fn stock_management_id(&self) -> StockManagementId {
        self.stock_management_id
    }

    pub fn part_number(&self) -> &str {
        &self.part_number
    }

    pub fn description(&self) -> &str {
        &self.description
    }

    pub fn location_name(&self) -> &str {
        &self.location_name
    }

    pub fn supplier_name(&self) -> &str {
        &self.supplier_name
    }

    pub fn last_issue_date(&self) -> Option<NaiveDate> {
        self.last_issue_date
    }

    pub fn packaging(&self) -> Packaging {
        self.packaging
    }

    pub fn qty_on_hand(&self) -> i64 {
        self.packaging.qty_on_hand()
    }

    pub fn unit_price_cents(&self) -> u64 {
        self.unit_price_cents
    }

    pub fn disposition(&self) -> Option<Disposition> {
        self.disposition
    }

    pub fn qty_to_bill(&self) -> i64 {
        self.qty_to_bill
    }

    pub fn qty_removed(&self) -> Option<i64> {
        self.qty_removed
    }

    pub fn unreturnable_reason(&self) -> Option<&UnreturnableReason> {
        self.unreturnable_reason.as_ref()
    }

    pub fn is_restockable(&self) -> bool {
        self.is_restockable
    }

    pub fn min_level(&self) -> Option<i64> {
        self.min_level
    }

    pub fn max_level(&self) -> Option<i64> {
        self.max_level
    }

    pub fn qty_to_remove(&self) -> i64 {
        self.qty_to_remove
    }

    pub fn qty_unreturnable(&self) -> Option<i64> {
        self.qty_unreturnable
    }

    pub fn status(&self) -> ItemStatus {
        self.status
    }

    /// Terminal lines never change again.
    pub fn is_locked(&self) -> bool {
        self.status.is_terminal()
    }

    /// A removal was recorded and it differs from what was staged.
    pub fn has_removal_shortfall(&self) -> bool {
        self.qty_removed.is_some_and(|removed| removed != self.qty_to_remove)
    }

    /// A shortfall exists and the representative has not explained it.
    pub fn has_unexplained_shortfall(&self) -> bool {
        self.has_removal_shortfall() && self.unreturnable_reason.is_none()
    }

    /// Monetary value of this line: billed plus unreturnable quantities at
    /// the unit price.
    pub fn line_value_cents(&self) -> u64 {
        let qty = self.qty_to_bill + self.qty_unreturnable.unwrap_or(0);
        (qty.max(0) as u64) * self.unit_price_cents
    }

    /// Recompute the derived quantities and enforce the reason invariant:
    /// a reason exists only while a recorded removal differs from the
    /// staged removal.
    pub(crate) fn recompute_derived(&mut self) {
        self.qty_to_remove = (self.packaging.qty_on_hand() - self.qty_to_bill).max(0);
        match self.qty_removed {
            Some(removed) => {
                self.qty_unreturnable =
                    Some((self.packaging.qty_on_hand() - self.qty_to_bill - removed).max(0));
                if removed == self.qty_to_remove {
                    self.unreturnable_reason = None;
                }
            }
            None => {
                self.qty_unreturnable = None;
                self.unreturnable_reason = None;
            }
        }
    }

    fn refresh(&mut self) {
        self.recompute_derived();
        self.status = status::advance(self);
    }

    pub(crate) fn apply_disposition(
        &mut self,
        disposition: Option<Disposition>,
        qty_to_bill: i64,
        qty_removed: Option<i64>,
    ) {
        self.disposition = disposition;
        self.qty_to_bill = qty_to_bill;
        self.qty_removed = qty_removed;
        self.refresh();
    }

    pub(crate) fn apply_qty_to_bill(&mut self, value: i64) {
        self.qty_to_bill = value;
        self.refresh();
    }

    pub(crate) fn apply_qty_removed(&mut self, value: i64) {
        self.qty_removed = Some(value);
        self.refresh();
    }

    pub(crate) fn apply_unreturnable_reason(&mut self, reason: Option<UnreturnableReason>) {
        self.unreturnable_reason = reason;
        self.refresh();
    }

    pub(crate) fn apply_restockable(&mut self, restockable: bool) {
        self.is_restockable = restockable;
        if !restockable {
            self.min_level = None;
            self.max_level = None;
        }
    }

    pub(crate) fn apply_min_level(&mut self, value: i64) {
        self.min_level = Some(value);
    }

    pub(crate) fn apply_max_level(&mut self, value: i64) {
        self.max_level = Some(value);
    }

    pub(crate) fn mark_final_approved(&mut self) {
        self.status = ItemStatus::CustomerFinalApprovalReceived;
    }
}

impl Entity for DeadstockItem {
    type Id = ItemId;

    fn id(&self) -> &Self::Id {
        &self.item_id
    }
}
