pub mod config;
pub mod tools;

pub use config::*;
pub use tools::*;
