pub mod ca;
pub mod capture;
pub mod commands;
pub mod config;
pub mod error;
pub mod proxy;
pub mod state;
pub mod tls;
