pub mod allowlist;
pub mod approvals;
pub mod conversations;
pub mod database;
pub mod error;
pub mod provider_state;
pub mod resumable;
pub mod row_helpers;
pub mod schema;
pub mod subagent_runs;

pub use allowlist::AllowlistRepo;
pub use approvals::{ApprovalDecision, ApprovalRepo, ApprovalRow, ApprovalStatus, ParkedCall};
pub use conversations::{ConversationKind, ConversationRepo};
pub use database::Database;
pub use error::StoreError;
pub use provider_state::{ProviderStateRepo, SqliteHealthRegistry};
pub use resumable::{ResumableCall, ResumableCallRepo};
pub use subagent_runs::{Cleanup, NewSubagentRun, RunUpdate, SubagentRunRepo, SubagentRunRow, SubagentStatus};
