pub mod color;
pub mod registry;
pub mod thread;

pub use registry::{ConversationRegistry, RegistryError};
pub use thread::Thread;
