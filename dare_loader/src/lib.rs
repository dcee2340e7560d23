pub mod assets;
pub mod handle;
pub mod id;
pub mod importer;
pub mod remap;
pub mod service;
pub mod task;
pub mod tables;
pub mod variant;
