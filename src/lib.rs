pub mod core;
pub mod services;
pub mod utils;

pub use crate::core::config::{Config, Settings};
pub use crate::services::runs::{RunService, SubmitOptions};
