pub mod api;
pub mod events;
pub mod models;
pub mod time;

pub use models::{Conversation, IncomingMessage, PeerId};
pub use time::parse_timestamp;
