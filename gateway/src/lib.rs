pub mod auth;
pub mod config;
pub mod db;
pub mod dispatcher;
pub mod errors;
pub mod fanout;
pub mod http;
pub mod ingest;
pub mod metrics;
pub mod model;
pub mod mqtt;
pub mod persist;
pub mod registry;
pub mod topics;
pub mod validate;
