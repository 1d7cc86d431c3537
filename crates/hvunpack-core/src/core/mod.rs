mod address;
pub(crate) mod macros;
mod memory_access;

pub use self::{
    address::{Gfn, Pa, Pid, Va, VcpuId},
    memory_access::MemoryAccess,
};
