//! Domain model (ids, commands, sessions, tasks, locks, errors).

pub mod command;
pub mod errors;
pub mod ids;
pub mod lock;
pub mod session;
pub mod task;

pub use command::{
    Command, CommandOp, CommandType, LockOwnership, SessionRef, SessionRegistration,
    TaskAssignment, TaskRef,
};
pub use errors::{ApplyError, LockError, QueueError, SessionError, StoreError};
pub use ids::{Id, IdMarker, NodeId, TaskId};
pub use lock::{DistributedLock, LockRecord};
pub use session::{DEFAULT_MAX_CONCURRENT_TASKS, SessionData, SessionStatus};
pub use task::{DEFAULT_MAX_RETRIES, DistributedTask, TaskStatus, TaskType};
