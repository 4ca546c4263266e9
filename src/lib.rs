pub mod adapter;
pub mod checkpoint;
pub mod commands;
pub mod config;
pub mod experiment;
pub mod registry;
pub mod scheduler;
pub mod shared;
