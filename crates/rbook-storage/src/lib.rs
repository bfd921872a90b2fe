pub mod cache;
pub mod durable;
pub mod keys;
pub mod mem;
pub mod redis;

pub use cache::{CacheStore, MemCache};
pub use durable::{RecordStore, StoreTx};
pub use mem::MemTable;
pub use self::redis::RedisCache;
