mod address;
mod info;
pub(crate) mod macros;
mod memory_access;

pub use self::{address::Va, info::TrackerInfo, memory_access::MemoryAccess};
