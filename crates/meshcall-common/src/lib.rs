pub mod errors;
pub mod events;
pub mod id;

pub use errors::{ConfigError, MeshcallError};
pub use events::EventBus;
pub use id::{new_id, PeerId, SocketId};

pub type Result<T> = std::result::Result<T, MeshcallError>;
