//! Deadstock review domain module (event-sourced).
//!
//! This crate contains the business rules for consignment deadstock
//! disposition: package-aware quantity reconciliation, the disposition
//! transition table, the per-item status machine, and the review aggregate
//! that coordinates them. Pure deterministic domain logic (no IO, no HTTP,
//! no storage).

pub mod disposition;
pub mod item;
pub mod quantity;
pub mod review;
pub mod role;
pub mod status;

pub use disposition::Disposition;
pub use item::{DeadstockItem, ItemSnapshot, UnreturnableReason};
pub use quantity::Packaging;
pub use review::{
    BulkClearDispositions, BulkSetDisposition, BulkSetRestockable, ConvertFullBillPartials,
    DeadstockReview, DispositionChanged, FinalApprovalReceived, Finalize, FinalizeBlockers,
    LoadSnapshot, QuantityChanged, QuantityField, RestockableChanged, ReviewCommand, ReviewEvent,
    ReviewFinalized, ReviewId, SetDisposition, SetQuantity, SetUnreturnableReason, SnapshotLoaded,
    SubmitFinalApproval, ToggleRestockable, UnreturnableReasonChanged,
};
pub use role::Role;
pub use status::ItemStatus;
