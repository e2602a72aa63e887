//! Partition-table driver, filesystem formatter and the disk layout model.

pub mod disk;
pub mod mkfs;
pub mod parted;

pub use disk::Disk;
pub use mkfs::{format_device, MkfsCall};
pub use parted::{DiskLayout, PartInfo, PartedCall, PartitionSpec};
