pub mod dispatcher;
pub mod executor;
pub mod matcher;
pub mod metrics;
pub mod policy;
pub mod pool;
pub mod parser;
pub mod prompt;
pub mod provider;
pub mod routing;
pub mod runtime;
pub mod state;
pub mod watcher;
pub mod worker;
pub mod writer;

pub use dispatcher::Dispatcher;
pub use executor::{ExecutionOutcome, Executor};
pub use matcher::EventMatcher;
pub use pool::WorkerPool;
pub use provider::{AiProvider, StaticProvider};
pub use runtime::Runtime;
pub use state::RuntimeState;
pub use watcher::ChangeStreamWatcher;
