//! Infrastructure layer

pub mod docker;
pub mod kubectl;
pub mod process;
pub mod session_store;
pub mod sqlite;
pub mod store;
