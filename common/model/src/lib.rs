//! Models shared by Kiln services and their consumers.

pub mod branch;
pub mod package;
