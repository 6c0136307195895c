use std::net::SocketAddr;
use std::sync::Arc;

use tracing::trace;

use crate::group::{ExceptionHandler, LogExceptionHandler};
use crate::net::game::{MessageDecoder, MessageEncoder, Rs317MessageDecoder, Rs317MessageEncoder};
use crate::net::login::{LoginEncoder, Rs317LoginEncoder};
use crate::net::message::GameMessage;
use crate::net::rsa::RsaPublicKey;

pub type MessageHandler = dyn Fn(&str, GameMessage) + Send + Sync;

// Per-group settings. Every field has a revision-317 default; servers
// without an RSA modulus leave `rsa_key` unset and the secure block is
// sent length-prefixed but in the clear.
#[derive(Clone)]
pub struct GroupConfig {
    pub connect_address: SocketAddr,
    pub message_encoder: Arc<dyn MessageEncoder>,
    pub message_decoder: Arc<dyn MessageDecoder>,
    pub login_encoder: Arc<dyn LoginEncoder>,
    pub rsa_key: Option<RsaPublicKey>,
    pub exception_handler: Arc<dyn ExceptionHandler>,
    pub message_handler: Arc<MessageHandler>,
}

impl Default for GroupConfig {
    fn default() -> Self {
        Self {
            connect_address: SocketAddr::from(([127, 0, 0, 1], 43594)),
            message_encoder: Arc::new(Rs317MessageEncoder),
            message_decoder: Arc::new(Rs317MessageDecoder),
            login_encoder: Arc::new(Rs317LoginEncoder),
            rsa_key: None,
            exception_handler: Arc::new(LogExceptionHandler),
            message_handler: Arc::new(|username, msg: GameMessage| {
                trace!(
                    username,
                    opcode = msg.opcode(),
                    size = msg.size(),
                    "dropping unhandled message"
                );
            }),
        }
    }
}

impl std::fmt::Debug for GroupConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GroupConfig")
            .field("connect_address", &self.connect_address)
            .field("rsa_key", &self.rsa_key.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_target_a_local_317_server() {
        let config = GroupConfig::default();
        assert_eq!(config.connect_address.port(), 43594);
        assert!(config.connect_address.ip().is_loopback());
        assert!(config.rsa_key.is_none());
    }
}
