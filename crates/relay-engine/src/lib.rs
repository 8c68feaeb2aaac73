pub mod approval;
pub mod error;
pub mod exec;
pub mod notices;
pub mod orchestrator;
pub mod registry;
pub mod runner;
pub mod subagent;
pub mod tools;
pub mod truncate;

pub use approval::{ApprovalService, Resolution};
pub use error::{EngineError, SubagentError};
pub use exec::{ExecPolicy, ExecTool};
pub use notices::NoticeBoard;
pub use orchestrator::{ApprovalOutcome, Orchestrator};
pub use registry::ToolRegistry;
pub use runner::{LoopConfig, PendingApproval, ToolLoop, TurnOutcome, TurnRequest};
pub use subagent::{RecoveryReport, SpawnRequest, SubagentConfig, SubagentOrchestrator};
