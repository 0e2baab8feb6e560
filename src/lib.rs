//! Generational, snapshot-isolated cache of published tree-structured content.

pub mod application;
pub mod cache;
pub mod config;
pub mod domain;
pub mod infra;
