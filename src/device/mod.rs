pub mod calibration;
pub mod connection;
pub mod constants;
pub mod decoder;
pub mod policy;
pub mod registry;
pub mod runtime;
pub mod session;
pub mod types;
