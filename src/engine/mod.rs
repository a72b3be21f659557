// Engine: memory and disk tiers, in-flight transfer coordination, and the service facade.

pub mod coordinator;
pub mod disk;
pub mod lru;
pub mod memory;
pub mod service;
pub mod stats;
pub mod task;
