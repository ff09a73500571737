pub mod configuration;
pub mod controller;
pub mod error_handling;
pub mod network;
pub mod telemetry;

pub use controller::Controller;
