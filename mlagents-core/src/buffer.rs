//! Per-agent and aggregate experience buffers.
mod base;
mod field;
mod key;
pub use base::AgentBuffer;
pub use field::AgentBufferField;
pub use key::{BufferKey, Padding};
