//! Plugin lifecycle: manifests, the node tree, the repository client and the
//! install pipeline that ties them together.

pub mod activation;
pub mod dependencies;
pub mod lifecycle;
pub mod manifest;
pub mod nodes;
pub mod pipeline;
pub mod registry;
pub mod repository;
pub mod status;
