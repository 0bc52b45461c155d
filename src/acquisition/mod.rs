//! Device-facing side of the pipeline: the UDP readout driver, the
//! acquisition configuration, and the controller that feeds received
//! pixels into the shared buffers.

pub mod config;
pub mod controller;
pub mod device;

pub use controller::AcqController;
