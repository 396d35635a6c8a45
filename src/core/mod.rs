//! 核心层：步骤错误分类与恢复提示

pub mod error;
pub mod recovery;

pub use error::{AgentError, StepError};
pub use recovery::{RecoveryEngine, RETRY_HINT};
