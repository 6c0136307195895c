use crate::error::BotError;
use crate::net::buffer::PacketBuffer;
use crate::net::connection::BotConnection;
use crate::net::message::GameMessage;

// Inbound frame lengths by opcode for revision 317. Positive entries
// are fixed sizes, -1 is a one-byte length prefix, -2 a two-byte
// little-endian length prefix.
pub const PACKET_LENGTHS: [i32; 256] = [
    0, 0, 0, 0, 6, 0, 0, 0, 4, 0, 0, 0, 0, 0, 0, 0, //
    0, 0, 0, 0, 0, 0, 0, 0, 1, 0, 0, 0, 0, 0, 0, 0, //
    0, 0, -2, 4, 3, 0, 0, 0, 0, 0, 0, 0, 5, 0, 0, 6, //
    0, 0, 9, 0, 0, -2, 0, 0, 0, 0, 0, 0, -2, 1, 0, 0, //
    2, -2, 0, 0, 0, 0, 6, 3, 2, 4, 2, 4, 0, 0, 0, 4, //
    0, -2, 0, 0, 7, 2, 0, 6, 0, 0, 0, 0, 0, 0, 0, 0, //
    0, 2, 0, 1, 0, 2, 0, 0, -1, 4, 1, 0, 0, 0, 1, 0, //
    0, 0, 2, 0, 0, 15, 0, 0, 0, 4, 4, 0, 0, 0, -2, 0, //
    0, 0, 0, 0, 0, 0, 6, 0, 0, 0, 0, 0, 0, 0, 2, 0, //
    0, 0, 0, 14, 0, 0, 0, 4, 0, 0, 0, 0, 3, 0, 0, 0, //
    4, 0, 0, 0, 2, 0, 6, 0, 0, 0, 0, 3, 0, 0, 5, 0, //
    10, 6, 0, 0, 0, 0, 0, 0, 0, 2, 0, 0, 0, 0, 0, 0, //
    0, 0, 0, 0, -1, 0, 0, 0, 4, 0, 0, 0, 0, 0, 3, 0, //
    2, 0, 0, 0, 0, 0, -2, 7, 0, 0, 2, 0, 0, 1, 0, 0, //
    0, 0, 0, 0, 0, 0, 8, 0, 0, 0, 0, 0, 0, 0, 0, 0, //
    2, -2, 0, 0, 0, 0, 6, 0, 4, 3, 0, 0, 0, -1, 6, 0, //
];

// Per-connection inbound parser state. A frame whose header or body is
// split across socket reads picks up where the previous feed stopped.
#[derive(Debug, Default)]
pub struct FrameParser {
    pub(crate) opcode: Option<u8>,
    pub(crate) length: Option<FrameLength>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum FrameLength {
    Fixed(usize),
    VarByte,
    VarShort,
}

impl FrameParser {
    pub fn reset(&mut self) {
        self.opcode = None;
        self.length = None;
    }
}

pub trait MessageEncoder: Send + Sync {
    fn encode(&self, conn: &mut BotConnection, msg: GameMessage) -> Result<(), BotError>;
}

pub trait MessageDecoder: Send + Sync {
    fn decode(&self, conn: &mut BotConnection, out: &mut Vec<GameMessage>) -> Result<(), BotError>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct Rs317MessageEncoder;

impl MessageEncoder for Rs317MessageEncoder {
    // Offsets the frame's opcode byte by the next encryptor word and
    // flushes the frame. Consumes exactly one word per message.
    fn encode(&self, conn: &mut BotConnection, mut msg: GameMessage) -> Result<(), BotError> {
        let key = conn
            .encryptor_mut()
            .ok_or_else(|| BotError::Protocol("outbound cipher missing".into()))?
            .next_key();
        let frame = msg.payload_mut().as_mut_slice();
        if frame.is_empty() {
            return Err(BotError::Protocol("empty outbound frame".into()));
        }
        frame[0] = frame[0].wrapping_add(key as u8);
        let frame = msg.into_payload().into_vec();
        conn.write_raw(&frame)
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct Rs317MessageDecoder;

impl MessageDecoder for Rs317MessageDecoder {
    fn decode(&self, conn: &mut BotConnection, out: &mut Vec<GameMessage>) -> Result<(), BotError> {
        loop {
            if conn.parser_mut().opcode.is_none() {
                let raw = match conn.read_buf_mut().get_u8() {
                    Some(raw) => raw,
                    None => break,
                };
                let key = conn
                    .decryptor_mut()
                    .ok_or_else(|| BotError::Protocol("inbound cipher missing".into()))?
                    .next_key();
                let opcode = raw.wrapping_sub(key as u8);
                let length = match PACKET_LENGTHS[opcode as usize] {
                    entry if entry >= 0 => FrameLength::Fixed(entry as usize),
                    -1 => FrameLength::VarByte,
                    _ => FrameLength::VarShort,
                };
                let parser = conn.parser_mut();
                parser.opcode = Some(opcode);
                parser.length = Some(length);
            }

            let length = match conn.parser_mut().length {
                Some(FrameLength::Fixed(length)) => length,
                Some(FrameLength::VarByte) => match conn.read_buf_mut().get_u8() {
                    Some(length) => length as usize,
                    None => break,
                },
                Some(FrameLength::VarShort) => match conn.read_buf_mut().get_u16_le() {
                    Some(length) => length as usize,
                    None => break,
                },
                None => break,
            };
            // Remember the resolved length so a split body does not
            // re-read its prefix on the next feed.
            conn.parser_mut().length = Some(FrameLength::Fixed(length));

            if conn.read_buf().remaining() < length {
                break;
            }
            let body = match conn.read_buf_mut().get_bytes(length) {
                Some(body) => body,
                None => break,
            };
            let opcode = match conn.parser_mut().opcode.take() {
                Some(opcode) => opcode,
                None => break,
            };
            conn.parser_mut().reset();
            out.push(GameMessage::decoded(
                opcode,
                length as i32,
                PacketBuffer::from_bytes(&body),
            ));
        }
        conn.read_buf_mut().compact();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::connection::{ConnState, StateCell};
    use crate::net::future::LoginFuture;
    use crate::net::isaac::Isaac;
    use std::io::Read;
    use std::sync::Arc;
    use std::time::Duration;

    const SEED: [u32; 4] = [11, 22, 33, 44];

    fn logged_in_pair() -> (BotConnection, std::net::TcpStream) {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").expect("bind");
        let addr = listener.local_addr().expect("addr");
        let client = std::net::TcpStream::connect(addr).expect("connect");
        let (server, _) = listener.accept().expect("accept");
        server
            .set_read_timeout(Some(Duration::from_secs(2)))
            .expect("timeout");
        client.set_nonblocking(true).expect("nonblocking");

        let cell = Arc::new(StateCell::new(ConnState::LoggedIn));
        let future = LoginFuture::new(Arc::clone(&cell));
        let (_tx, rx) = crossbeam_channel::unbounded();
        let mut conn = BotConnection::new(
            mio::net::TcpStream::from_std(client),
            mio::Token(1),
            "bot".to_string(),
            "pw".to_string(),
            None,
            cell,
            future,
            rx,
        );
        conn.install_ciphers(SEED);
        (conn, server)
    }

    // The decryptor mirror a scripted server would hold.
    fn server_side_encoder() -> Isaac {
        Isaac::new(SEED.map(|w| w.wrapping_add(50)))
    }

    #[test]
    fn packet_length_table_spot_checks() {
        assert_eq!(PACKET_LENGTHS.len(), 256);
        assert_eq!(PACKET_LENGTHS[4], 6);
        assert_eq!(PACKET_LENGTHS[34], -2);
        assert_eq!(PACKET_LENGTHS[104], -1);
        assert_eq!(PACKET_LENGTHS[117], 15);
        assert_eq!(PACKET_LENGTHS[253], -1);
        assert_eq!(PACKET_LENGTHS[255], 0);
    }

    #[test]
    fn encode_offsets_the_opcode_and_consumes_one_key() {
        let (mut conn, mut server) = logged_in_pair();
        let mut reference = Isaac::new(SEED);

        Rs317MessageEncoder
            .encode(&mut conn, GameMessage::fixed(50, &[1, 2, 3]))
            .expect("first frame");
        let mut frame = [0u8; 4];
        server.read_exact(&mut frame).expect("first read");
        assert_eq!(frame[0], 50u8.wrapping_add(reference.next_key() as u8));
        assert_eq!(&frame[1..], &[1, 2, 3]);

        Rs317MessageEncoder
            .encode(&mut conn, GameMessage::fixed(131, &[]))
            .expect("second frame");
        let mut frame = [0u8; 1];
        server.read_exact(&mut frame).expect("second read");
        assert_eq!(frame[0], 131u8.wrapping_add(reference.next_key() as u8));
    }

    #[test]
    fn encode_without_a_cipher_is_a_protocol_error() {
        let (mut conn, _server) = logged_in_pair();
        conn.take_ciphers_for_test();
        match Rs317MessageEncoder.encode(&mut conn, GameMessage::fixed(1, &[])) {
            Err(BotError::Protocol(_)) => {}
            other => panic!("expected protocol error, got {other:?}"),
        }
    }

    #[test]
    fn decode_fixed_frames() {
        let (mut conn, _server) = logged_in_pair();
        let mut keys = server_side_encoder();

        // Opcode 8 carries a fixed four byte body.
        conn.read_buf_mut()
            .feed(&[8u8.wrapping_add(keys.next_key() as u8), 9, 8, 7, 6]);
        let mut out = Vec::new();
        Rs317MessageDecoder
            .decode(&mut conn, &mut out)
            .expect("decode");
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].opcode(), 8);
        assert_eq!(out[0].size(), 4);
        assert_eq!(out[0].payload().as_slice(), &[9, 8, 7, 6]);
    }

    #[test]
    fn decode_zero_length_frames_back_to_back() {
        let (mut conn, _server) = logged_in_pair();
        let mut keys = server_side_encoder();

        conn.read_buf_mut().feed(&[
            0u8.wrapping_add(keys.next_key() as u8),
            1u8.wrapping_add(keys.next_key() as u8),
        ]);
        let mut out = Vec::new();
        Rs317MessageDecoder
            .decode(&mut conn, &mut out)
            .expect("decode");
        assert_eq!(out.len(), 2);
        assert_eq!(out[0].opcode(), 0);
        assert_eq!(out[1].opcode(), 1);
        assert_eq!(out[0].size(), 0);
    }

    #[test]
    fn decode_var_byte_frames() {
        let (mut conn, _server) = logged_in_pair();
        let mut keys = server_side_encoder();

        conn.read_buf_mut()
            .feed(&[104u8.wrapping_add(keys.next_key() as u8), 3, 0xAA, 0xBB, 0xCC]);
        let mut out = Vec::new();
        Rs317MessageDecoder
            .decode(&mut conn, &mut out)
            .expect("decode");
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].opcode(), 104);
        assert_eq!(out[0].size(), 3);
        assert_eq!(out[0].payload().as_slice(), &[0xAA, 0xBB, 0xCC]);
    }

    #[test]
    fn decode_var_short_frames_beyond_255_bytes() {
        let (mut conn, _server) = logged_in_pair();
        let mut keys = server_side_encoder();

        let body: Vec<u8> = (0..259u32).map(|v| v as u8).collect();
        conn.read_buf_mut()
            .feed(&[34u8.wrapping_add(keys.next_key() as u8), 0x03, 0x01]);
        conn.read_buf_mut().feed(&body);
        let mut out = Vec::new();
        Rs317MessageDecoder
            .decode(&mut conn, &mut out)
            .expect("decode");
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].opcode(), 34);
        assert_eq!(out[0].size(), 259);
        assert_eq!(out[0].payload().as_slice(), &body[..]);
    }

    #[test]
    fn decode_resumes_after_partial_feeds() {
        let (mut conn, _server) = logged_in_pair();
        let mut keys = server_side_encoder();
        let mut out = Vec::new();

        // Header only.
        conn.read_buf_mut()
            .feed(&[104u8.wrapping_add(keys.next_key() as u8)]);
        Rs317MessageDecoder
            .decode(&mut conn, &mut out)
            .expect("header");
        assert!(out.is_empty());

        // Length prefix, still no body.
        conn.read_buf_mut().feed(&[4]);
        Rs317MessageDecoder
            .decode(&mut conn, &mut out)
            .expect("length");
        assert!(out.is_empty());

        // Half the body.
        conn.read_buf_mut().feed(&[1, 2]);
        Rs317MessageDecoder
            .decode(&mut conn, &mut out)
            .expect("half body");
        assert!(out.is_empty());

        // The rest, plus a trailing zero-length frame to prove the
        // keystream stayed aligned at one word per opcode.
        conn.read_buf_mut().feed(&[3, 4]);
        conn.read_buf_mut()
            .feed(&[0u8.wrapping_add(keys.next_key() as u8)]);
        Rs317MessageDecoder
            .decode(&mut conn, &mut out)
            .expect("rest");
        assert_eq!(out.len(), 2);
        assert_eq!(out[0].opcode(), 104);
        assert_eq!(out[0].payload().as_slice(), &[1, 2, 3, 4]);
        assert_eq!(out[1].opcode(), 0);
    }

    #[test]
    fn decode_without_a_cipher_is_a_protocol_error() {
        let (mut conn, _server) = logged_in_pair();
        conn.take_ciphers_for_test();
        conn.read_buf_mut().feed(&[1, 2, 3]);
        let mut out = Vec::new();
        match Rs317MessageDecoder.decode(&mut conn, &mut out) {
            Err(BotError::Protocol(_)) => {}
            other => panic!("expected protocol error, got {other:?}"),
        }
    }
}
