//! Value object trait: equality by value, not identity.

/// Marker trait for value objects.
///
/// Value objects are immutable and compared by their attribute values: two
/// `Money { 1000, USD }` instances are the same value. To "modify" one, build a
/// new one.
///
/// ```ignore
/// let a = Money::new(1000, Currency::USD);
/// let b = Money::new(1000, Currency::USD);
/// assert_eq!(a, b);
/// ```
pub trait ValueObject: Clone + PartialEq + core::fmt::Debug {}
