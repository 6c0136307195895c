mod config;
mod error;
mod group;
mod net;

pub use config::{GroupConfig, MessageHandler};
pub use error::BotError;
pub use group::{Bot, BotGroup, ExceptionHandler, LogExceptionHandler};
pub use net::buffer::{BufferError, ByteOrder, ByteTransform, PacketBuffer};
pub use net::connection::{BotConnection, ConnState, ReadBuffer};
pub use net::future::LoginFuture;
pub use net::game::{
    FrameParser, MessageDecoder, MessageEncoder, Rs317MessageDecoder, Rs317MessageEncoder,
    PACKET_LENGTHS,
};
pub use net::isaac::Isaac;
pub use net::login::{encode_base37, LoginEncoder, Rs317LoginEncoder, CLIENT_REVISION};
pub use net::message::{GameMessage, SIZE_VAR_BYTE, SIZE_VAR_SHORT};
pub use net::rsa::RsaPublicKey;
