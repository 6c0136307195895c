use std::io::{self, Read, Write};
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

use crossbeam_channel::Receiver;
use mio::net::TcpStream;
use mio::Token;

use crate::error::BotError;
use crate::net::future::LoginFuture;
use crate::net::game::FrameParser;
use crate::net::isaac::Isaac;
use crate::net::message::GameMessage;
use crate::net::rsa::RsaPublicKey;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ConnState {
    Registered = 0,
    InitialRequest = 1,
    InitialResponse = 2,
    FinalResponse = 3,
    LoggedIn = 4,
    LoggedOut = 5,
}

impl ConnState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => ConnState::Registered,
            1 => ConnState::InitialRequest,
            2 => ConnState::InitialResponse,
            3 => ConnState::FinalResponse,
            4 => ConnState::LoggedIn,
            _ => ConnState::LoggedOut,
        }
    }

    pub fn is_login_stage(self) -> bool {
        matches!(
            self,
            ConnState::InitialRequest | ConnState::InitialResponse | ConnState::FinalResponse
        )
    }
}

// LoggedOut is terminal; later stores are ignored.
#[derive(Debug)]
pub struct StateCell(AtomicU8);

impl StateCell {
    pub(crate) fn new(state: ConnState) -> Self {
        Self(AtomicU8::new(state as u8))
    }

    pub fn load(&self) -> ConnState {
        ConnState::from_u8(self.0.load(Ordering::SeqCst))
    }

    pub(crate) fn store(&self, state: ConnState) {
        let _ = self
            .0
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |current| {
                if ConnState::from_u8(current) == ConnState::LoggedOut {
                    None
                } else {
                    Some(state as u8)
                }
            });
    }
}

const READ_BUFFER_CAPACITY: usize = 256;
const READ_CHUNK: usize = 1024;

// Socket-side inbound buffer. Partial frames survive across wake-ups:
// consumed bytes are dropped by `compact` and the tail is kept.
#[derive(Debug, Default)]
pub struct ReadBuffer {
    data: Vec<u8>,
    pos: usize,
    eof: bool,
}

impl ReadBuffer {
    pub(crate) fn new() -> Self {
        Self {
            data: Vec::with_capacity(READ_BUFFER_CAPACITY),
            pos: 0,
            eof: false,
        }
    }

    pub fn remaining(&self) -> usize {
        self.data.len() - self.pos
    }

    pub(crate) fn hit_eof(&self) -> bool {
        self.eof
    }

    pub(crate) fn fill(&mut self, stream: &mut TcpStream) -> io::Result<usize> {
        let mut total = 0;
        let mut chunk = [0u8; READ_CHUNK];
        loop {
            match stream.read(&mut chunk) {
                Ok(0) => {
                    self.eof = true;
                    break;
                }
                Ok(count) => {
                    self.data.extend_from_slice(&chunk[..count]);
                    total += count;
                }
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => break,
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => return Err(err),
            }
        }
        Ok(total)
    }

    pub(crate) fn feed(&mut self, bytes: &[u8]) {
        self.data.extend_from_slice(bytes);
    }

    pub fn get_u8(&mut self) -> Option<u8> {
        if self.remaining() < 1 {
            return None;
        }
        let value = self.data[self.pos];
        self.pos += 1;
        Some(value)
    }

    pub fn get_u16_le(&mut self) -> Option<u16> {
        if self.remaining() < 2 {
            return None;
        }
        let lo = self.data[self.pos] as u16;
        let hi = self.data[self.pos + 1] as u16;
        self.pos += 2;
        Some(hi << 8 | lo)
    }

    pub fn get_u64_be(&mut self) -> Option<u64> {
        if self.remaining() < 8 {
            return None;
        }
        let mut value = 0u64;
        for offset in 0..8 {
            value = value << 8 | self.data[self.pos + offset] as u64;
        }
        self.pos += 8;
        Some(value)
    }

    pub fn get_bytes(&mut self, amount: usize) -> Option<Vec<u8>> {
        if self.remaining() < amount {
            return None;
        }
        let bytes = self.data[self.pos..self.pos + amount].to_vec();
        self.pos += amount;
        Some(bytes)
    }

    pub fn skip(&mut self, amount: usize) -> Option<()> {
        if self.remaining() < amount {
            return None;
        }
        self.pos += amount;
        Some(())
    }

    pub fn compact(&mut self) {
        self.data.drain(..self.pos);
        self.pos = 0;
    }
}

// One bot's socket, buffers and cipher state. Owned and driven
// exclusively by the group's IO thread.
pub struct BotConnection {
    pub(crate) stream: TcpStream,
    pub(crate) token: Token,
    username: String,
    password: String,
    rsa_key: Option<RsaPublicKey>,
    state: Arc<StateCell>,
    future: LoginFuture,
    read_buf: ReadBuffer,
    pub(crate) outbound: Receiver<GameMessage>,
    encryptor: Option<Isaac>,
    decryptor: Option<Isaac>,
    parser: FrameParser,
}

impl BotConnection {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        stream: TcpStream,
        token: Token,
        username: String,
        password: String,
        rsa_key: Option<RsaPublicKey>,
        state: Arc<StateCell>,
        future: LoginFuture,
        outbound: Receiver<GameMessage>,
    ) -> Self {
        Self {
            stream,
            token,
            username,
            password,
            rsa_key,
            state,
            future,
            read_buf: ReadBuffer::new(),
            outbound,
            encryptor: None,
            decryptor: None,
            parser: FrameParser::default(),
        }
    }

    pub fn username(&self) -> &str {
        &self.username
    }

    pub fn password(&self) -> &str {
        &self.password
    }

    pub fn rsa_key(&self) -> Option<&RsaPublicKey> {
        self.rsa_key.as_ref()
    }

    pub fn state(&self) -> ConnState {
        self.state.load()
    }

    pub fn set_state(&self, state: ConnState) {
        self.state.store(state);
    }

    pub fn read_buf(&self) -> &ReadBuffer {
        &self.read_buf
    }

    pub fn read_buf_mut(&mut self) -> &mut ReadBuffer {
        &mut self.read_buf
    }

    pub fn parser_mut(&mut self) -> &mut FrameParser {
        &mut self.parser
    }

    // Login frames and encoded game frames bypass the outbound queue
    // and go straight to the socket. The reactor must never block, so
    // a send buffer that cannot take a whole frame counts as a lost
    // connection.
    pub fn write_raw(&mut self, mut bytes: &[u8]) -> Result<(), BotError> {
        while !bytes.is_empty() {
            match self.stream.write(bytes) {
                Ok(0) => return Err(io::Error::from(io::ErrorKind::WriteZero).into()),
                Ok(count) => bytes = &bytes[count..],
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => return Err(err.into()),
            }
        }
        Ok(())
    }

    // Seeds the session ciphers: the encryptor takes the seed words
    // as-is, the decryptor takes each word offset by 50.
    pub fn install_ciphers(&mut self, seed: [u32; 4]) {
        self.encryptor = Some(Isaac::new(seed));
        self.decryptor = Some(Isaac::new(seed.map(|word| word.wrapping_add(50))));
    }

    pub fn encryptor_mut(&mut self) -> Option<&mut Isaac> {
        self.encryptor.as_mut()
    }

    pub fn decryptor_mut(&mut self) -> Option<&mut Isaac> {
        self.decryptor.as_mut()
    }

    pub fn signal_login(&self) {
        self.future.signal();
    }

    pub(crate) fn fill_read_buf(&mut self) -> io::Result<usize> {
        self.read_buf.fill(&mut self.stream)
    }

    #[cfg(test)]
    pub(crate) fn take_ciphers_for_test(&mut self) {
        self.encryptor = None;
        self.decryptor = None;
    }

    pub(crate) fn close(&mut self) {
        let _ = self.stream.shutdown(std::net::Shutdown::Both);
        self.state.store(ConnState::LoggedOut);
        self.future.signal();
    }
}

impl std::fmt::Debug for BotConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BotConnection")
            .field("username", &self.username)
            .field("token", &self.token)
            .field("state", &self.state.load())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn logged_out_is_terminal() {
        let cell = StateCell::new(ConnState::Registered);
        cell.store(ConnState::InitialRequest);
        assert_eq!(cell.load(), ConnState::InitialRequest);
        cell.store(ConnState::LoggedOut);
        cell.store(ConnState::LoggedIn);
        assert_eq!(cell.load(), ConnState::LoggedOut);
    }

    #[test]
    fn login_stages_are_classified() {
        assert!(!ConnState::Registered.is_login_stage());
        assert!(ConnState::InitialRequest.is_login_stage());
        assert!(ConnState::InitialResponse.is_login_stage());
        assert!(ConnState::FinalResponse.is_login_stage());
        assert!(!ConnState::LoggedIn.is_login_stage());
        assert!(!ConnState::LoggedOut.is_login_stage());
    }

    #[test]
    fn read_buffer_cursor_and_compaction() {
        let mut buf = ReadBuffer::new();
        buf.feed(&[0, 0, 0, 0, 0, 0, 0, 9, 0x34, 0x12, 7]);
        assert_eq!(buf.get_u64_be(), Some(9));
        assert_eq!(buf.get_u16_le(), Some(0x1234));
        assert_eq!(buf.remaining(), 1);
        buf.compact();
        assert_eq!(buf.remaining(), 1);
        assert_eq!(buf.get_u8(), Some(7));
        assert_eq!(buf.get_u8(), None);
    }

    #[test]
    fn read_buffer_partial_reads_wait_for_more_bytes() {
        let mut buf = ReadBuffer::new();
        buf.feed(&[1, 2]);
        assert_eq!(buf.get_u64_be(), None);
        assert_eq!(buf.get_bytes(3), None);
        buf.feed(&[3]);
        assert_eq!(buf.get_bytes(3), Some(vec![1, 2, 3]));
    }
}
