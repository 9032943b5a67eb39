//! Domain model: flow definitions, execution state, and repository traits.

pub mod execution;
pub mod flow_definition;
pub mod repository;
