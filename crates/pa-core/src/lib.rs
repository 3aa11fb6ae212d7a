pub mod clock;
pub mod config;
pub mod db;
pub mod hashing;
pub mod store;
pub mod types;
