pub mod config;
pub mod create;
pub mod db;
pub mod delete;
pub mod error;
pub mod geometry;
pub mod live;
pub mod project;
pub mod retry;
pub mod sync;
pub mod tile;

pub use error::{Error, ErrorKind, Result};
