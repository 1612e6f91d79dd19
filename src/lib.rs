pub mod agent;
pub mod archive;
pub mod cache;
pub mod catalog;
pub mod config;
pub mod dispatch;
pub mod health;
pub mod metric;
pub mod migrate;
pub mod probe;
pub mod purge;
pub mod reconcile;
pub mod repository;
pub mod schedule;
pub mod state;
pub mod supervisor;
pub mod writer;
