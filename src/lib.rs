pub mod audit;
pub mod backfill;
pub mod config;
pub mod domain;
pub mod error;
pub mod fields;
pub mod gateway;
pub mod geometry;
pub mod output;
pub mod planner;
pub mod soil;
pub mod store;
pub mod tui;
pub mod vegetation;
