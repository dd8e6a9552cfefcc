pub mod error;
pub mod execution_index;
pub mod fault;
pub mod headers;
pub mod request;
pub mod server_state;
pub mod test_execution;
pub mod vclock;

pub use error::DomainError;
pub use execution_index::ExecutionIndex;
pub use fault::{FaultDirective, FaultKind, ForcedException};
pub use request::{GeneratedId, InstrumentationType, RequestLogEntry, UpdateRequest};
pub use server_state::ServerState;
pub use test_execution::{EXTERNAL_SERVICE, LoggedCall, ResponseLogEntry, TestExecution};
pub use vclock::VectorClock;
