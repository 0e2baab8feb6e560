//! Application layer: collaborator traits and the binary's error surface.

pub mod error;
pub mod repos;
