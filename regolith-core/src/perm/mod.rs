//! Per-source destination access control.
//!
//! A [`PermissionEngine`] holds the global [`AddressMatcher`] and one
//! matcher per client source host, compiled from a
//! [`PolicySet`](regolith_config::PolicySet).

pub mod address;
mod engine;
mod matcher;

pub use engine::{PermissionEngine, PolicySnapshot};
pub use matcher::{AddressMatcher, WildcardMatcher};
pub use regolith_config::Action;
