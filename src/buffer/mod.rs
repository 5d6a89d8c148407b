pub mod descriptor;
pub mod manager;
pub mod table;

pub use descriptor::{BufferDescriptor, DescriptorRecord};
pub use manager::BufferManager;
pub use table::BufferHandle;
