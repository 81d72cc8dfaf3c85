//! Infrastructure Module
//!
//! Host-facing adapters: the BLE link transport, the mock-location sink
//! seam, and logging setup.

pub mod ble;
pub mod logging;
pub mod mock_location;
