//! Kernel-mode driver bindings for HSA agents.
//!
//! Each binding implements [`Driver`]: the `amdxdna` accelerator driver in
//! [`xdna`] and the `amdkfd` GPU driver in [`kfd`].

pub mod config;
pub mod driver;
pub mod error;
pub mod kfd;
pub mod logging;
pub mod runtime;
pub mod utils;
pub mod xdna;

pub use config::DriverConfig;
pub use driver::{
    AccessPermission, CuConfig, DeviceNode, Driver, DriverQuery, DriverType, DriverVersionInfo,
    HwCtxConfig, HwCtxConfigType, ShareableHandle,
};
pub use error::{HsaError, HsaResult, HsaStatus};
pub use kfd::KfdDriver;
pub use logging::init_logging;
pub use xdna::XdnaDriver;
