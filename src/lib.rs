pub mod bootstrap;
pub mod config;
pub mod db;
pub mod errors;
pub mod handlers;
pub mod logging;
pub mod models;
pub mod routes;
pub mod services;
pub mod shutdown;
pub mod state;
pub mod supervisor;
pub mod worker;
