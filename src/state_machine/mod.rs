// State machines for process, node and task lifecycles.
//
// Every machine is a pure transition function over a closed status enum:
// it validates the event, runs guards and stamps the row. Persistence,
// history and event publication happen in the orchestration layer.

pub mod errors;
pub mod events;
pub mod guards;
pub mod node_state_machine;
pub mod process_state_machine;
pub mod states;
pub mod task_state_machine;

// Re-export main types for convenient access
pub use errors::{StateMachineError, StateMachineResult};
pub use events::{NodeEvent, ProcessEvent, TaskEvent};
pub use node_state_machine::NodeStateMachine;
pub use process_state_machine::ProcessStateMachine;
pub use states::{NodeStatus, ProcessStatus, TaskStatus};
pub use task_state_machine::TaskStateMachine;

pub use guards::StateGuard;
