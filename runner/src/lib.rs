pub mod adapter;
pub mod collector;
pub mod config;
pub mod events;
pub mod executors;
pub mod ingest;
pub mod report;
pub mod resources;
pub mod scheduler;
pub mod task;

#[cfg(test)]
mod scheduler_test;
