pub mod actors;
pub mod config;
pub mod coordination;
pub mod error;
pub mod health;
pub mod id;
pub mod log;
pub mod swarm;
pub mod telemetry;
pub mod util;
pub mod workflow;

pub use error::{Error, Result};
