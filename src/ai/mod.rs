pub mod cloud_api;
pub mod context;
pub mod prompt;
pub mod sanitize;

pub use cloud_api::*;
pub use context::*;
