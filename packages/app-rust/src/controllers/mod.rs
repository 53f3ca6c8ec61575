//! Request-handling units wired into the application at startup.

pub mod config;
pub mod resource;

pub use config::ConfigController;
pub use resource::ResourceController;
