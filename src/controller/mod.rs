pub mod clock;
pub mod harvester;
pub mod refinery;
pub mod retry;
pub mod store;

pub use harvester::{error_policy, reconcile, Context, ReconcileError};
pub use refinery::{reconcile_refinery, refinery_error_policy};
