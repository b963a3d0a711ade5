pub mod consumer;
pub mod dlq;
pub mod mem;
pub mod redis;
pub mod traits;

pub use consumer::ConsumerGroupManager;
pub use dlq::{DeadLetterQueue, DlqEntry};
pub use mem::InMemoryQueue;
pub use redis::RedisQueue;
pub use traits::*;
