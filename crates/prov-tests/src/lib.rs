//! Integration harness for the provisioning pipeline
//!
//! Runs the real license client, image composer and delivery drivers
//! against in-process doubles:
//! - [`MockAuthority`] - license authority over HTTP, counts billing events
//! - [`MockOtaDevice`] - device web server accepting OTA uploads
//! - [`Bench`] - temporary release, settings file and license store
//!
//! # Running Tests
//!
//! ```bash
//! cargo test -p prov-tests
//! ```
//!
//! OTA tests bind several loopback addresses (`127.0.0.x`), which Linux
//! routes to `lo` without extra setup.

pub mod authority;
pub mod bench;
pub mod device;
pub mod server;

pub use authority::MockAuthority;
pub use bench::{identity, Bench, TOKEN};
pub use device::{MockOtaDevice, Upload};
pub use server::TestServer;
