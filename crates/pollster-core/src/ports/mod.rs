//! Ports - 抽象化レイヤー
//!
//! エージェントの協調相手をトレイトとして定義します（Hexagonal Architecture の「ポート」）。
//! app 層はこれらのトレイトだけを見ます。実装は `impls`（インメモリ）か、
//! 実際のブローカーやデータベースを扱う別クレートに置きます。

pub mod clock;
pub mod id_generator;
pub mod object_storage;
pub mod processing_checker;
pub mod queue;
pub mod result_finalizer;
pub mod session_store;
pub mod task_store;
pub mod worker;

pub use self::clock::{Clock, ManualClock, SystemClock};
pub use self::id_generator::{IdGenerator, UlidGenerator};
pub use self::object_storage::ObjectStorage;
pub use self::processing_checker::ProcessingChecker;
pub use self::queue::{PullQueue, PushQueue, QueueMessage};
pub use self::result_finalizer::ResultFinalizer;
pub use self::session_store::SessionStore;
pub use self::task_store::{Expected, OwnerMatch, TaskStore};
pub use self::worker::{ComputeRequest, WorkerConnector, WorkerStream};
