use crate::error::BotError;
use crate::net::buffer::PacketBuffer;
use crate::net::connection::{BotConnection, ConnState};

pub const CLIENT_REVISION: u16 = 317;

// Placeholder client UID sent in the secure block.
const CLIENT_UID: u32 = 455437;
// Number of archive CRC placeholder words in the client-info block.
const CRC_WORDS: usize = 9;

// Packs up to twelve characters of a username into a 64-bit value, one
// base-37 digit per character, stripping trailing filler.
pub fn encode_base37(name: &str) -> u64 {
    let mut value: u64 = 0;
    for c in name.chars().take(12) {
        let c = c.to_ascii_lowercase();
        let digit = match c {
            'a'..='z' => c as u64 - 'a' as u64 + 1,
            '0'..='9' => c as u64 - '0' as u64 + 27,
            _ => 0,
        };
        value = value.wrapping_mul(37).wrapping_add(digit);
    }
    while value != 0 && value % 37 == 0 {
        value /= 37;
    }
    value
}

// Drives one step of the login handshake. Invoked by the reactor while
// the connection is in a login stage; implementations wait for more
// bytes by leaving the read buffer compacted and the state unchanged.
pub trait LoginEncoder: Send + Sync {
    fn encode(&self, conn: &mut BotConnection) -> Result<(), BotError>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct Rs317LoginEncoder;

impl LoginEncoder for Rs317LoginEncoder {
    fn encode(&self, conn: &mut BotConnection) -> Result<(), BotError> {
        match conn.state() {
            ConnState::InitialRequest => initial_request(conn),
            ConnState::InitialResponse => initial_response(conn),
            ConnState::FinalResponse => final_response(conn),
            _ => Ok(()),
        }
    }
}

fn initial_request(conn: &mut BotConnection) -> Result<(), BotError> {
    let mut request = PacketBuffer::with_capacity(2);
    request.put_u8(14);
    request.put_u8((encode_base37(conn.username()) >> 16 & 31) as u8);
    conn.write_raw(request.as_slice())?;
    conn.set_state(ConnState::InitialResponse);
    Ok(())
}

fn initial_response(conn: &mut BotConnection) -> Result<(), BotError> {
    if conn.read_buf().remaining() < 17 {
        conn.read_buf_mut().compact();
        return Ok(());
    }

    let read_buf = conn.read_buf_mut();
    let (opcode, server_seed) = {
        let _ = read_buf.skip(8);
        match (read_buf.get_u8(), read_buf.get_u64_be()) {
            (Some(opcode), Some(server_seed)) => (opcode, server_seed),
            // Unreachable behind the 17-byte check above.
            _ => return Err(BotError::Protocol("short initial response".into())),
        }
    };
    if opcode != 0 {
        return Err(BotError::LoginRejected { opcode });
    }

    let seed = [
        rand::random::<u32>(),
        rand::random::<u32>(),
        (server_seed >> 32) as u32,
        server_seed as u32,
    ];

    let mut secure = PacketBuffer::new();
    secure.put_u8(10);
    for word in seed {
        secure.put_u32(word);
    }
    secure.put_u32(CLIENT_UID);
    secure.put_string(conn.username());
    secure.put_string(conn.password());
    secure.encode_rsa(conn.rsa_key());

    let mut client_info = PacketBuffer::new();
    client_info.put_u8(16);
    client_info.put_u8((secure.written() + 40) as u8);
    client_info.put_u8(255);
    client_info.put_u16(CLIENT_REVISION);
    client_info.put_u8(0);
    for _ in 0..CRC_WORDS {
        client_info.put_u32(rand::random::<u32>());
    }
    client_info.put_buffer(&secure);
    conn.write_raw(client_info.as_slice())?;

    conn.install_ciphers(seed);
    conn.set_state(ConnState::FinalResponse);
    Ok(())
}

fn final_response(conn: &mut BotConnection) -> Result<(), BotError> {
    if conn.read_buf().remaining() < 3 {
        conn.read_buf_mut().compact();
        return Ok(());
    }

    let read_buf = conn.read_buf_mut();
    let opcode = match read_buf.get_u8() {
        Some(opcode) => opcode,
        // Unreachable behind the 3-byte check above.
        _ => return Err(BotError::Protocol("short final response".into())),
    };
    if opcode != 2 {
        return Err(BotError::LoginRejected { opcode });
    }
    let _ = read_buf.skip(2);

    conn.set_state(ConnState::LoggedIn);
    conn.signal_login();
    Ok(())
}
