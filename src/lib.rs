pub mod build;
pub mod config;
pub mod errors;
pub mod merge;
pub mod models;
pub mod orchestrator;
pub mod qa;
pub mod store;
pub mod worktree;
