pub mod catalog;
pub mod counterexample;
pub mod error;
pub mod generator;
pub mod reduction;
pub mod schedule;

pub use catalog::{CatalogModule, ErrorTemplate, ExceptionTemplate, FaultCatalog, MetadataTemplate};
pub use counterexample::Counterexample;
pub use error::{CatalogError, CounterexampleError};
pub use generator::enumerate_candidates;
pub use reduction::{causal_descendents, is_subset_match, outcomes_match, should_prune};
pub use schedule::{ScheduleStack, should_schedule};
