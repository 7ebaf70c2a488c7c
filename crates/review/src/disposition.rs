//! Disposition choices and their quantity side effects.

use serde::{Deserialize, Serialize};

use deadstock_core::DomainResult;

use crate::item::DeadstockItem;

/// Outcome chosen for an item's consignment stock.
///
/// `None` at the item level means the customer has not decided yet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Disposition {
    /// Invoice the full on-hand quantity; nothing is returned.
    InvoiceAll,
    /// Invoice part of the stock; the rest is returned in whole packages.
    InvoicePartial,
    /// Return everything beyond the broken-package minimum.
    Return,
}

impl Disposition {
    /// Whether the billable quantity stays editable under this disposition.
    pub fn allows_bill_edit(self) -> bool {
        matches!(self, Disposition::InvoicePartial)
    }

    /// Whether the removed quantity stays editable under this disposition.
    pub fn allows_removed_edit(self) -> bool {
        matches!(self, Disposition::InvoicePartial | Disposition::Return)
    }
}

/// Resulting `(qty_to_bill, qty_removed)` when a disposition is chosen,
/// per the transition table:
///
/// - invoice-all: bill everything, removal is settled at zero
/// - return: bill only the broken-package minimum
/// - invoice-partial: keep the current billable quantity, re-snapped
/// - cleared: back to billing everything (the undecided default)
pub(crate) fn decide_quantities(
    item: &DeadstockItem,
    disposition: Option<Disposition>,
) -> DomainResult<(i64, Option<i64>)> {
    let packaging = item.packaging();
    match disposition {
        Some(Disposition::InvoiceAll) => Ok((packaging.qty_on_hand(), Some(0))),
        Some(Disposition::Return) => {
            Ok((packaging.broken_package_minimum(), item.qty_removed()))
        }
        Some(Disposition::InvoicePartial) => Ok((
            packaging.snap_qty_to_bill(item.qty_to_bill())?,
            item.qty_removed(),
        )),
        None => Ok((packaging.qty_on_hand(), item.qty_removed())),
    }
}
