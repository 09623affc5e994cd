//! Integrity chains over protected data.

pub mod cascade;

pub use cascade::{seal, CascadeChain, CascadeError};
