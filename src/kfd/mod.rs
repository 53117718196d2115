//! Binding for `amdkfd`, the generic GPU compute driver.

pub mod device;
pub mod driver;
pub mod ioctl;
pub mod sysfs;

pub use device::{KfdDevice, KfdIoctl};
pub use driver::KfdDriver;
pub use sysfs::{Node, Topology};
