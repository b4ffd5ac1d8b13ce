pub mod handle;
pub mod pins;
pub mod set;
pub mod sysfs;
pub mod types;

pub use handle::*;
pub use pins::*;
pub use set::*;
pub use sysfs::SysfsDriver;
pub use types::*;
