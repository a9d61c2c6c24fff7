pub mod etcd;
pub mod keys;
pub mod memory;
pub mod types;

pub use etcd::EtcdMetaStore;
pub use memory::MemoryMetaStore;
pub use types::MetaStore;
