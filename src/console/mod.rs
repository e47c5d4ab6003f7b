pub mod application;
pub mod input;
