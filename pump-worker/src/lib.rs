pub mod config;
pub mod error;
pub mod pumps;
pub mod state;
pub mod worker;
