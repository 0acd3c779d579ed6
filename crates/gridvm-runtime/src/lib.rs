//! # gridvm-runtime
//!
//! Platform- and architecture-specific runtime pieces for gridvm:
//!
//! - Guarded stack allocation (mmap + guard page)
//! - Machine-context switching (naked assembly per architecture)
//! - Stackful coroutine tasks with cooperative yield and
//!   destruction-time forced unwind
//!
//! Everything here plugs into the platform-agnostic engine in
//! `gridvm-core`: a [`coroutine::CoroutineTask`] is an ordinary pool task
//! whose `run` switches onto its own stack.

pub mod arch;
pub mod context;
pub mod coroutine;
pub mod stack;

// Re-exports for convenience
pub use context::{switch_context, ContextEntry, MachineContext};
pub use coroutine::{coroutine_task, this_coroutine, CoState, CoroutineTask};
pub use stack::{default_stack_size, minimum_stack_size, page_size, Stack};
