pub mod aggregator;
pub mod batcher;
pub mod config;
pub mod db;
pub mod engine;
pub mod error;
pub mod handlers;
pub mod messenger;
pub mod model;
pub mod resolver;
pub mod roster;
pub mod worker;
