mod actors;
mod app;
mod config;
mod metrics;
mod paas;
mod rpc;

// for main.rs
pub use app::run;
