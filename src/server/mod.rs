pub mod access;
pub mod config;
pub mod crypto;
pub mod handlers;
pub mod models;
pub mod ratelimit;
pub mod service;
pub mod sqlite;
pub mod time;

pub use handlers::{build_rocket, launch};
pub use service::PasteService;
