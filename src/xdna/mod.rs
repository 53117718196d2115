//! Binding for `amdxdna`, the AI-engine accelerator driver.

pub mod cache;
pub mod device;
pub mod driver;
pub mod heap;
pub mod ioctl;

pub use device::{AccelDevice, XdnaIoctl};
pub use driver::{BoInfo, BoKind, XDNA_DRIVER_NAME, XdnaDriver};
pub use heap::{DEV_HEAP_ALIGN, DEV_HEAP_SIZE, DeviceHeap};
