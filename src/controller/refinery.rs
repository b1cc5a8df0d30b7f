//! Refinery controller: runs the goreplay receiver that shadows forward to

pub mod receiver;
pub mod reconcile;
pub mod validation;

pub use reconcile::*;

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[path = "refinery_test.rs"]
mod tests;
