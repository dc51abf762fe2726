//! Domain models

pub mod cluster;
pub mod environment;
pub mod quantity;
pub mod session;
pub mod template;
