//! Host-facing event plumbing.

pub mod events;
