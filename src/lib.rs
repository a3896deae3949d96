pub mod addr;
pub mod assembler;
pub mod config;
pub mod error;
pub mod export;
pub mod layers;
pub mod meter;
pub mod planner;
pub mod profile;
pub mod scheduler;
pub mod sizegen;
pub mod structs;
pub mod timegen;

pub use error::Error;
