pub mod config;
pub mod deletion;
pub mod errors;
pub mod execution;
pub mod integrity;
pub mod lifecycle;
pub mod remote;
pub mod store;
pub mod terminal;
