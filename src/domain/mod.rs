//! Domain layer - storage objects and port definitions
//!
//! This module defines the core types and the traits (ports) that hypervisor
//! adapters implement, following hexagonal architecture principles.

pub mod model;
pub mod path;
pub mod ports;

pub use model::*;
pub use path::*;
pub use ports::*;
