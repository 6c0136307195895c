pub mod buffer;
pub mod connection;
pub mod future;
pub mod game;
pub mod isaac;
pub mod login;
pub mod message;
pub mod reactor;
pub mod rsa;
