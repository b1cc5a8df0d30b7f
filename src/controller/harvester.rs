pub mod annotations;
pub mod discovery;
pub mod reconcile;
pub mod requeue;
pub mod shadow;
pub mod split;
pub mod status;
pub mod validation;

pub use reconcile::*;

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)] // Tests can use unwrap/expect for brevity
#[path = "harvester_test.rs"]
mod tests;
