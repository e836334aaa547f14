pub mod config;
pub mod context;
pub mod file_paths;
pub mod logging;
pub mod retry;
