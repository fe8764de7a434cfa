//! Mapping layer: the named transformations library and the engine that
//! applies type/field/status mappings to canonical work items.

pub mod engine;
pub mod transform;

pub use engine::{MappedWorkItem, MappingEngine, MappingIssue, MappingValidation};
pub use transform::{apply_chain, parse_chain, TransformStep};
