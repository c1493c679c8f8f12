//! Filesystem primitives shared across the deploy pipeline.

pub mod link_mode;
pub mod lock;
pub mod materialize;
pub mod tree_hash;

pub use link_mode::LinkMode;
pub use lock::{LockHolder, PathLock, PathLockGuard};
pub(crate) use lock::is_process_alive;
pub use materialize::{MaterializeReport, materialize_tree, swap_symlink, write_atomic};
pub use tree_hash::{hash_inputs, hash_tree};
