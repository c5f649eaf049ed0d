pub mod actions;
pub mod agent;
pub mod extractor;
pub mod models;
pub mod ports;
