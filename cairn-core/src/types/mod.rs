//! Value objects describing partitions, images and their sources.

pub mod image;
pub mod partition;
pub mod source;

pub use image::Image;
pub use partition::{Firmware, Partition, PartitionLayout};
pub use source::ImageSource;
