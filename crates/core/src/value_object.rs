//! Value object trait: equality by value, not identity.

/// Marker trait for value objects.
///
/// Value objects are **immutable** and **compared by value**; they represent
/// concepts where identity doesn't matter. To "modify" one, create a new one
/// with the new values.
///
/// `Packaging { qty_on_hand: 24, package_size: 10 }` is a value object; an
/// inventory line with an id is an entity.
pub trait ValueObject: Clone + PartialEq + core::fmt::Debug {}
