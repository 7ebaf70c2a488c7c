//! Per-item workflow status and its forward-only state machine.

use serde::{Deserialize, Serialize};

use crate::disposition::Disposition;
use crate::item::DeadstockItem;

/// Workflow status of one review line.
///
/// Strictly forward-moving, except for the explicit reset when the
/// disposition is cleared. `CustomerFinalApprovalReceived` is terminal:
/// nothing on the item changes afterwards.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemStatus {
    AwaitingCustomerAction,
    PendingStockVerification,
    PendingCustomerFinalApproval,
    CustomerFinalApprovalReceived,
}

impl ItemStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, ItemStatus::CustomerFinalApprovalReceived)
    }
}

impl core::fmt::Display for ItemStatus {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let s = match self {
            ItemStatus::AwaitingCustomerAction => "awaiting_customer_action",
            ItemStatus::PendingStockVerification => "pending_stock_verification",
            ItemStatus::PendingCustomerFinalApproval => "pending_customer_final_approval",
            ItemStatus::CustomerFinalApprovalReceived => "customer_final_approval_received",
        };
        f.write_str(s)
    }
}

/// Re-derive an item's status from its current field values.
///
/// Evaluated after every mutation. Idempotent: a second run with no
/// intervening change yields the same status. Terminal items are skipped
/// entirely.
pub(crate) fn advance(item: &DeadstockItem) -> ItemStatus {
    let current = item.status();
    if current.is_terminal() {
        return current;
    }

    let Some(disposition) = item.disposition() else {
        // Un-setting a decision resets the line.
        return ItemStatus::AwaitingCustomerAction;
    };

    match disposition {
        // No physical removal step needed.
        Disposition::InvoiceAll => ItemStatus::PendingCustomerFinalApproval,
        Disposition::Return | Disposition::InvoicePartial => {
            let mut status = current;
            if status == ItemStatus::AwaitingCustomerAction {
                status = ItemStatus::PendingStockVerification;
            }
            if status == ItemStatus::PendingStockVerification {
                if let Some(removed) = item.qty_removed() {
                    let settled = removed == item.qty_to_remove()
                        || item.unreturnable_reason().is_some();
                    if settled {
                        status = ItemStatus::PendingCustomerFinalApproval;
                    }
                }
            }
            status
        }
    }
}
