//! The runtime: the value model and heap, namespaces and vars,
//! lazy-sequence realization, and the two back ends that execute
//! analyzed code - the tree walker and the bytecode VM.

pub mod env;
pub mod heap;
pub mod lazy;
pub mod rt;
pub mod value;
pub mod vm;
pub mod walk;

pub use heap::{Heap, ObjRef};
pub use rt::Rt;
pub use value::Value;
