pub mod error;
pub mod rest;
pub mod session;
pub mod socket;
pub mod wire;

pub use error::ClientError;
pub use rest::RestClient;
pub use session::Session;
pub use socket::{MessageSender, SocketClient, SocketEvent, SocketHandle};
