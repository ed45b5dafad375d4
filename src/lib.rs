pub mod amc;
pub mod config;
pub mod messages;
pub mod runtime;
