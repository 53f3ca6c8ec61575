//! `ThemeDesk` App — theme configuration store and the controllers exposing
//! it over the core dispatch framework.

pub mod controllers;
pub mod paths;
pub mod store;

pub use paths::AppPaths;
pub use store::{ConfigStore, ThemeManifest};
