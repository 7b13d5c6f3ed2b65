pub mod auth;
pub mod certificates;
pub mod config;
pub mod db;
pub mod engine;
pub mod error;
pub mod models;
pub mod progress;
pub mod routes;
pub mod store;
