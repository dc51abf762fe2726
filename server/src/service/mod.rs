//! Business logic services

pub mod background;
pub mod registry;
pub mod session;
pub mod validation;
