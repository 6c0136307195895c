use crate::net::buffer::PacketBuffer;

pub const SIZE_VAR_BYTE: i32 = -1;
pub const SIZE_VAR_SHORT: i32 = -2;

// An inbound or outbound game frame. Outbound messages carry the full
// wire frame in `payload` (opcode byte first) so the encoder can offset
// the opcode in place; decoded messages carry only the body.
#[derive(Debug, Clone)]
pub struct GameMessage {
    opcode: u8,
    size: i32,
    payload: PacketBuffer,
}

impl GameMessage {
    pub fn fixed(opcode: u8, body: &[u8]) -> Self {
        let mut frame = PacketBuffer::with_capacity(body.len() + 1);
        frame.start_message(opcode);
        frame.put_bytes(body);
        Self {
            opcode,
            size: body.len() as i32,
            payload: frame,
        }
    }

    pub fn var(opcode: u8, body: &[u8]) -> Self {
        let mut frame = PacketBuffer::with_capacity(body.len() + 2);
        frame.start_var_message(opcode);
        frame.put_bytes(body);
        let _ = frame.end_var_message();
        Self {
            opcode,
            size: SIZE_VAR_BYTE,
            payload: frame,
        }
    }

    pub fn var_short(opcode: u8, body: &[u8]) -> Self {
        let mut frame = PacketBuffer::with_capacity(body.len() + 3);
        frame.start_var_short_message(opcode);
        frame.put_bytes(body);
        let _ = frame.end_var_short_message();
        Self {
            opcode,
            size: SIZE_VAR_SHORT,
            payload: frame,
        }
    }

    // A frame assembled by hand with the PacketBuffer header helpers.
    pub fn from_frame(frame: PacketBuffer) -> Option<Self> {
        let opcode = *frame.as_slice().first()?;
        let size = frame.written() as i32 - 1;
        Some(Self {
            opcode,
            size,
            payload: frame,
        })
    }

    pub(crate) fn decoded(opcode: u8, size: i32, payload: PacketBuffer) -> Self {
        Self {
            opcode,
            size,
            payload,
        }
    }

    pub fn opcode(&self) -> u8 {
        self.opcode
    }

    pub fn size(&self) -> i32 {
        self.size
    }

    pub fn payload(&self) -> &PacketBuffer {
        &self.payload
    }

    pub fn payload_mut(&mut self) -> &mut PacketBuffer {
        &mut self.payload
    }

    pub fn into_payload(self) -> PacketBuffer {
        self.payload
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fixed_frames_start_with_the_opcode() {
        let msg = GameMessage::fixed(50, &[1, 2, 3]);
        assert_eq!(msg.opcode(), 50);
        assert_eq!(msg.size(), 3);
        assert_eq!(msg.payload().as_slice(), &[50, 1, 2, 3]);
    }

    #[test]
    fn var_frames_carry_a_patched_length() {
        let msg = GameMessage::var(120, &[9, 9]);
        assert_eq!(msg.size(), SIZE_VAR_BYTE);
        assert_eq!(msg.payload().as_slice(), &[120, 2, 9, 9]);

        let msg = GameMessage::var_short(53, &[7; 300]);
        assert_eq!(msg.size(), SIZE_VAR_SHORT);
        assert_eq!(&msg.payload().as_slice()[..3], &[53, 0x01, 0x2C]);
    }

    #[test]
    fn from_frame_reads_the_leading_opcode() {
        let mut frame = PacketBuffer::new();
        frame.start_message(77);
        frame.put_u16(0xBEEF);
        let msg = GameMessage::from_frame(frame).expect("frame");
        assert_eq!(msg.opcode(), 77);
        assert_eq!(msg.size(), 2);

        assert!(GameMessage::from_frame(PacketBuffer::new()).is_none());
    }
}
