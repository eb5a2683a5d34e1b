//! App - アプリケーション層
//!
//! このモジュールは、ports を組み合わせてエージェントの振る舞いを実装します。
//!
//! - **acquisition**: 配信されたタスクの獲得、またはメッセージの扱いの決定
//! - **handler**: プリフェッチ、ワーカー呼び出し、結果の記録、キャンセル
//! - **agent**: ポーリングループとエラーバジェット
//! - **retry_chain**: 失敗した試行と後継タスク
//! - **builder**: ワイヤリング

pub mod acquisition;
pub mod agent;
pub mod backoff;
pub mod builder;
pub mod context;
pub mod handler;
pub mod health;
pub mod prefetch;
pub mod retry_chain;

pub use self::acquisition::{acquire, Acquisition};
pub use self::agent::{Agent, AgentExit};
pub use self::backoff::RetryPolicy;
pub use self::builder::{AgentBuilder, BuildError};
pub use self::context::AgentContext;
pub use self::handler::{handle_message, HandlerReport, RunningTasks, TaskCancellation};
pub use self::health::HealthMonitor;
