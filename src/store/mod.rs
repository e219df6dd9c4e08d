pub mod db;
pub mod models;

pub use db::{DbHandle, StudioDb};
pub use models::*;
