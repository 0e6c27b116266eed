pub mod codec;
pub mod config;
pub mod error;
pub mod layout;
pub mod manifest;
pub mod path_safety;
pub mod reconcile;
pub mod service;
pub mod store;

pub use error::{Error, Result};
