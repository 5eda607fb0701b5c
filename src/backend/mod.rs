//! Snapshot backends.
//!
//! Two interchangeable strategies: [`ResourceBackend`] exports and
//! re-imports individual typed records, [`StateBackend`] captures and
//! replays a version of the engine's own persisted state object.

/// Category dependency table
pub mod category;
mod resource;
mod state;

pub use category::{CategoryDefinition, CategoryTable};
pub use resource::{CategoryExport, CategoryPlan, ResourceBackend, ResourcePlan};
pub use state::{StateBackend, StatePlan, StateRestore};
