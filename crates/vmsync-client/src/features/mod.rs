pub mod actions;
pub mod observability;
pub mod provisioning;
pub mod resource_sync;
