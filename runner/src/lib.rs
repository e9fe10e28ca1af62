pub mod campaign;
pub mod config;
pub mod database;
pub mod executors;
pub mod gateway;
pub mod ingest;
pub mod parameters;
mod process;
pub mod tracker;
