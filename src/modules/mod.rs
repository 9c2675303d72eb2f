//! Built-in modules shipped with the host.

pub mod disk;
