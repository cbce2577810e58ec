//! Session orchestration: the `Mapper` facade and its state machine.

mod mapper;
pub mod session;

pub use mapper::Mapper;
pub use session::{FixOutcome, FrameOutcome, SampleOutcome, SessionPhase, SessionStats};
