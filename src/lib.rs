pub mod cli;
pub mod compose;
pub mod config;
pub mod executor;
pub mod models;
pub mod report;
pub mod scanners;
pub mod stacking;
pub mod stats;
pub mod store;
pub mod tracker;
