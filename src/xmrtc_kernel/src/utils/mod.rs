//! Utility
//!
//! **This module is exempt from the API stability guarantee.**

/// Trait for types having a constant default value. This is essentially a
/// constant version of `Default`.
pub trait Init {
    /// The default value.
    const INIT: Self;
}
