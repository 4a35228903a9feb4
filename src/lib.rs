pub mod app;
pub mod config;
pub mod errors;
pub mod extract;
pub mod handlers;
pub mod ledger;
pub mod middleware;
pub mod models;
pub mod repository;
pub mod retry;
