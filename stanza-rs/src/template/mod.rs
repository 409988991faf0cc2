//! Template building: markup scanning, the node tree, tag definitions, resource
//! loading and the per-URI cache.

pub mod ast;
pub mod cache;
pub mod loader;
pub mod parse;
pub mod tags;
