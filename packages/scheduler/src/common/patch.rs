//! Field-level update wrapper for partial mutations.
//!
//! Update inputs must distinguish "leave this field alone" from "set this
//! field to a value" (including setting a nullable field to NULL). `Patch<T>`
//! makes that distinction explicit in the type: only `Set` fields are written
//! and named in the audit diff summary.

/// A field in an update input: either untouched or set to a new value.
///
/// For nullable columns use `Patch<Option<T>>`, where `Set(None)` clears the
/// column and `Keep` leaves it unchanged.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Patch<T> {
    /// Leave the current value in place.
    Keep,
    /// Write the provided value.
    Set(T),
}

// Manual impl: the derive would demand `T: Default`, which update inputs
// holding non-defaultable payloads cannot satisfy.
impl<T> Default for Patch<T> {
    fn default() -> Self {
        Patch::Keep
    }
}

impl<T> Patch<T> {
    /// Returns `true` if this field should be written.
    pub fn is_set(&self) -> bool {
        matches!(self, Patch::Set(_))
    }

    /// Returns the value to write, if any.
    pub fn as_set(&self) -> Option<&T> {
        match self {
            Patch::Set(value) => Some(value),
            Patch::Keep => None,
        }
    }

    /// Consumes the patch, returning the value to write, if any.
    pub fn into_set(self) -> Option<T> {
        match self {
            Patch::Set(value) => Some(value),
            Patch::Keep => None,
        }
    }

    /// Applies the patch over the current value, returning the effective one.
    pub fn apply(self, current: T) -> T {
        match self {
            Patch::Set(value) => value,
            Patch::Keep => current,
        }
    }
}

impl<T> From<Option<T>> for Patch<T> {
    /// Maps `Some(v)` to `Set(v)` and `None` to `Keep`.
    ///
    /// Convenient at API boundaries where absent request fields mean "keep".
    fn from(value: Option<T>) -> Self {
        match value {
            Some(value) => Patch::Set(value),
            None => Patch::Keep,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_keep_is_default() {
        let patch: Patch<i32> = Patch::default();
        assert!(!patch.is_set());
        assert_eq!(patch.apply(7), 7);
    }

    #[test]
    fn test_set_overrides() {
        let patch = Patch::Set(3);
        assert!(patch.is_set());
        assert_eq!(patch.as_set(), Some(&3));
        assert_eq!(patch.apply(7), 3);
    }

    #[test]
    fn test_set_none_clears_nullable() {
        let patch: Patch<Option<i32>> = Patch::Set(None);
        assert!(patch.is_set());
        assert_eq!(patch.apply(Some(9)), None);
    }

    #[test]
    fn test_from_option() {
        assert_eq!(Patch::from(Some(1)), Patch::Set(1));
        assert_eq!(Patch::<i32>::from(None), Patch::Keep);
    }
}
