//! # gridvm-fabric
//!
//! The node/port messaging fabric and the VM runtime of gridvm:
//!
//! - `address` - four-component node addresses
//! - `clock` - scalar (Lamport) and vector logical clocks
//! - `message` - typed fabric messages and the session protocol
//! - `wire` - newline-delimited JSON framing
//! - `edge` - generation-checked edge arena
//! - `node` - addressed nodes and the two-axis edge graph
//! - `port` - nodes with a text-stream surface
//! - `reactor` - single-threaded event loops, assigned round-robin
//! - `session` - the framed TCP request/reply protocol
//! - `vm` - the runtime owning pools, acceptor and registry
//!
//! The execution engine underneath lives in `gridvm-core`; stackful
//! coroutine tasks in `gridvm-runtime` can be posted to the VM's pool
//! like any other task.

pub mod address;
pub mod clock;
pub mod edge;
pub mod error;
pub mod message;
pub mod node;
pub mod port;
pub mod reactor;
pub mod session;
pub mod vm;
pub mod wire;

// Re-exports for convenience
pub use address::Address;
pub use clock::{ScalarTime, VectorTime};
pub use edge::{EdgeArena, EdgeHandle};
pub use error::{FabricError, FabricResult};
pub use message::{Message, MessageKind, Reply, ReplyKind, Request, RequestKind};
pub use node::Node;
pub use port::{OpenMode, Port};
pub use reactor::{Reactor, ReactorPool};
pub use session::Session;
pub use vm::{shutdown_requested, Vm, VmConfig};
