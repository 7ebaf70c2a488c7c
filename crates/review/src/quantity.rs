//! Package-size-aware quantity reconciliation.

use serde::{Deserialize, Serialize};

use deadstock_core::{DomainError, DomainResult, ValueObject};

/// Physical packaging facts for one inventory line.
///
/// Consignment stock is returned in complete packages; whatever does not
/// form a complete package (the broken package) stays with the customer.
/// Every quantity decision is snapped onto the grid this implies.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Packaging {
    qty_on_hand: i64,
    package_size: i64,
}

impl ValueObject for Packaging {}

impl Packaging {
    /// Build from upstream facts. Values are normalized defensively
    /// (`qty_on_hand >= 0`, `package_size >= 1`); snapshot validation
    /// rejects malformed records before they get here.
    pub fn new(qty_on_hand: i64, package_size: i64) -> Self {
        Self {
            qty_on_hand: qty_on_hand.max(0),
            package_size: package_size.max(1),
        }
    }

    pub fn qty_on_hand(&self) -> i64 {
        self.qty_on_hand
    }

    pub fn package_size(&self) -> i64 {
        self.package_size
    }

    /// The partial package the customer must always retain.
    ///
    /// Stateless: depends only on `qty_on_hand` and `package_size`.
    pub fn broken_package_minimum(&self) -> i64 {
        if self.package_size <= 1 {
            0
        } else {
            self.qty_on_hand % self.package_size
        }
    }

    /// Snap a requested billable quantity onto the valid grid.
    ///
    /// Valid values are `min_keep + k * package_size` within
    /// `[min_keep, qty_on_hand]`, where `min_keep` is the broken-package
    /// minimum. Negative input is rejected so the caller can flag operator
    /// error instead of silently clamping.
    pub fn snap_qty_to_bill(&self, raw: i64) -> DomainResult<i64> {
        if raw < 0 {
            return Err(DomainError::validation("quantity to bill cannot be negative"));
        }
        if self.package_size <= 1 {
            return Ok(raw.clamp(0, self.qty_on_hand));
        }

        let min_keep = self.broken_package_minimum();
        let steps = round_half_away(raw - min_keep, self.package_size);
        let snapped = min_keep + steps * self.package_size;
        Ok(snapped.clamp(min_keep, self.qty_on_hand))
    }

    /// Snap a verified removed quantity onto whole packages, bounded by
    /// what is actually staged for removal given the current billable
    /// quantity.
    pub fn snap_qty_removed(&self, raw: i64, qty_to_bill: i64) -> DomainResult<i64> {
        if raw < 0 {
            return Err(DomainError::validation("quantity removed cannot be negative"));
        }
        let limit = (self.qty_on_hand - qty_to_bill).max(0);
        if self.package_size <= 1 {
            return Ok(raw.clamp(0, limit));
        }

        let snapped = round_half_away(raw, self.package_size) * self.package_size;
        Ok(snapped.clamp(0, limit))
    }
}

/// Round `num / den` to the nearest integer, halves away from zero.
///
/// `den` must be positive.
fn round_half_away(num: i64, den: i64) -> i64 {
    debug_assert!(den > 0);
    if num >= 0 {
        (num + den / 2) / den
    } else {
        -((-num + den / 2) / den)
    }
}
