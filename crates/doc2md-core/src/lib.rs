// doc2md-core - Domain model shared by every other crate
//
// Defines the task aggregate and its tagged enums (type, status, priority),
// query filters, the statistics view, and the filename codec that repairs
// non-ASCII filenames arriving via URLs or object metadata.
//
// I/O lives elsewhere:
// - Persistence: doc2md-store
// - Object storage: doc2md-storage
// - Conversion engines: doc2md-engine
// - Scheduling: doc2md-scheduler

pub mod codec;
pub mod task;

pub use task::{
    DocumentTask, SourceSpec, TaskCreate, TaskFilter, TaskPriority, TaskStatistics, TaskStatus,
    TaskType, TaskValidationError,
};
