//! Workflow definition sources.
//!
//! Definitions are authored elsewhere; the engine only reads the active
//! ones for an event's trigger type.

pub mod definition;

pub use definition::{
    ActiveDefinitions, DefinitionSource, InMemoryDefinitionSource, PgDefinitionSource,
    UnreadableDefinition,
};
