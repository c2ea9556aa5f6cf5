pub mod constants;
pub mod error;
pub mod pose;
pub mod transform;
pub mod stats;
pub mod rehearsal;
pub mod case_store;
pub mod net;
pub mod navigation;
pub mod config;

pub use error::{NavError, Result};
