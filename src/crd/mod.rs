pub mod harvester;
pub mod refinery;
