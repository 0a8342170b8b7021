mod camera;
mod cv_utils;
mod detection;
mod detector;
mod pipeline;
mod routes;
mod server;
mod speech;
mod stream;
mod telemetry;

pub mod app;
pub mod config;

pub use app::start_app;
