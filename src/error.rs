use crate::net::buffer::BufferError;

#[derive(Debug, thiserror::Error)]
pub enum BotError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Buffer(#[from] BufferError),

    #[error("login rejected with response opcode {opcode}")]
    LoginRejected { opcode: u8 },

    #[error("protocol violation: {0}")]
    Protocol(String),

    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("group already contains bot '{username}'")]
    DuplicateBot { username: String },

    #[error("no bot named '{username}' in this group")]
    UnknownBot { username: String },

    #[error("the event loop has terminated, this group is no longer usable")]
    LoopTerminated,
}
