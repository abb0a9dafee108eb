//! Reconciliation logic for DexServer resources

pub mod certificates;
pub mod dexserver;
pub mod drift;
pub mod status;
