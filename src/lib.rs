pub mod auth;
pub mod chain;
pub mod config;
pub mod document;
pub mod error;
pub mod notify;
pub mod service;
pub mod store;
pub mod utils;
