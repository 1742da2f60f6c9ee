pub mod pool;
pub mod replica;

pub use pool::DispatchPool;
pub use replica::{ExecutionMode, ReplicaHandle};
