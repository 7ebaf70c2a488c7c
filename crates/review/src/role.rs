use serde::{Deserialize, Serialize};

/// Acting party in the disposition workflow.
///
/// Authentication and session handling live outside this core; the role is
/// trusted input and only gates edit/bulk/approval eligibility.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// The consignment customer deciding dispositions.
    Customer,
    /// The PTS representative who verifies and removes returned stock.
    Representative,
}
