pub mod accelerator;
pub mod api;
pub mod applier;
pub mod components;
pub mod config;
pub mod connector;
pub mod controllers;
pub mod resources;
pub mod storage;
pub mod util;
pub mod workload;

#[cfg(test)]
pub mod fixtures;
