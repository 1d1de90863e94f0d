//! Domain model module declarations.

pub mod checkpoint;
pub mod session;
pub mod step;
