//! Resource model.
//!
//! The typed graph of desired resources, their attribute bindings and the
//! fingerprints used to detect changes.

mod fingerprint;
mod graph;
mod value;

pub use fingerprint::Fingerprinter;
pub use graph::{DeploymentGraph, OutputDef, Resource};
pub use value::{
    AttributeValue, Attributes, Reference, ResolvedAttributes, TemplatePart, is_id_char,
};
