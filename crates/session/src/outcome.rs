//! Per-operation results handed back to the caller.

use serde::{Deserialize, Serialize};

use deadstock_core::ItemId;
use deadstock_review::{DeadstockItem, ItemStatus, Role};

/// Aggregate metrics over the collection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReviewSummary {
    pub total_items: usize,
    /// Sum of (billed + unreturnable) quantities at each line's unit
    /// price, in smallest currency units.
    pub total_value_cents: u64,
    /// Lines still awaiting a disposition decision.
    pub pending_decisions: usize,
}

impl ReviewSummary {
    pub fn compute(items: &[DeadstockItem]) -> Self {
        Self {
            total_items: items.len(),
            total_value_cents: items.iter().map(DeadstockItem::line_value_cents).sum(),
            pending_decisions: items
                .iter()
                .filter(|item| item.disposition().is_none())
                .count(),
        }
    }
}

/// Enabled/disabled signals for the caller's save/finalize/approve actions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActionAvailability {
    pub can_save: bool,
    pub can_finalize: bool,
    pub can_approve: bool,
}

impl ActionAvailability {
    pub fn compute(role: Role, items: &[DeadstockItem]) -> Self {
        let locked = items.iter().any(DeadstockItem::is_locked);
        let undecided = items.iter().any(|item| item.disposition().is_none());
        let all_ready = !items.is_empty()
            && items
                .iter()
                .all(|item| item.status() == ItemStatus::PendingCustomerFinalApproval);

        Self {
            can_save: !locked && !undecided,
            can_finalize: !locked && !undecided,
            can_approve: role == Role::Customer && !locked && all_ready,
        }
    }
}

/// Result of one engine operation: the updated lines plus recomputed
/// collection-level signals.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OperationOutcome {
    /// The lines the operation touched, in their post-operation state.
    pub updated: Vec<DeadstockItem>,
    pub summary: ReviewSummary,
    pub actions: ActionAvailability,
}

impl OperationOutcome {
    /// Identifiers of the touched lines (bulk feedback counts).
    pub fn affected(&self) -> Vec<ItemId> {
        self.updated.iter().map(DeadstockItem::item_id).collect()
    }
}
