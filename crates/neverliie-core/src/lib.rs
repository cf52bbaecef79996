//! neverliie-core — wire format, launch registry, and shared paths.
//! All other NeverLiie crates depend on this one.

pub mod config;
pub mod registry;
pub mod wire;

pub use registry::{LaunchDescriptor, LaunchMode, Registry};
pub use wire::{Envelope, WireError, WIRE_VERSION};
