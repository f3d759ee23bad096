//! Data model shared by the engine components.

pub mod function;
pub mod object;
pub mod trigger;

pub use function::{Function, FunctionTarget};
pub use object::{DiscoveredObject, ObjectEntry};
pub use trigger::{Trigger, TriggerKey, TriggerSpec, TriggerStatus};
