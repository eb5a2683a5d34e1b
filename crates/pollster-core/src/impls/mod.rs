//! Impls - 実装（開発用・テスト用）
//!
//! このモジュールには全ポートのインメモリ実装を含めます。永続化はしません。

pub mod checker;
pub mod dependency;
pub mod finalizer;
pub mod memory_queue;
pub mod memory_storage;
pub mod memory_store;
pub mod simulated_worker;

pub use checker::StaticProcessingChecker;
pub use finalizer::InMemoryResultFinalizer;
pub use memory_queue::InMemoryQueue;
pub use memory_storage::InMemoryObjectStorage;
pub use memory_store::{InMemorySessionStore, InMemoryTaskStore};
pub use simulated_worker::{SimulatedWorker, WorkerBehavior, WorkerCall};
