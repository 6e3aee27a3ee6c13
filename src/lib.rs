pub mod app;
pub mod config;
pub mod control;
pub mod db;
pub mod enrich;
pub mod failsafe;
pub mod model;
pub mod overseer;
pub mod scheduler;
pub mod sitemap;
pub mod stages;
pub mod store;
pub mod trigger;
