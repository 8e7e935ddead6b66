// doc2md - Document-conversion task orchestrator
//
// Facade crate: re-exports the pieces an embedder needs to wire the
// orchestrator into a larger program. The binary in main.rs is a thin CLI
// over `doc2md_server::run_with_config`.

pub use doc2md_config::RuntimeConfig;
pub use doc2md_core::{
    DocumentTask, TaskCreate, TaskFilter, TaskPriority, TaskStatistics, TaskStatus, TaskType,
};
pub use doc2md_server::run_with_config;
