use bytes::{BufMut, BytesMut};

use crate::frame::{additive_checksum, FrameHeader};
use crate::{Command, KeywordRing, ProtocolError, HEADER_SIZE, MAX_PAYLOAD_SIZE};

/// Incremental frame encoder for one direction of one connection.
///
/// Each appended frame consumes one keyword ring slot, except for the
/// fixed-keyword variant used by the connection-init frame sent before the
/// rings are in lockstep.
#[derive(Default)]
pub struct FrameEncoder {
    buf: BytesMut,
    ring: KeywordRing,
    frames_encoded: u64,
}

impl FrameEncoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a frame, drawing the keyword from the ring.
    pub fn append_frame(
        &mut self,
        command: Command,
        client_tick: u32,
        payload: &[u8],
    ) -> Result<(), ProtocolError> {
        let keyword = self.ring.current();
        self.append_raw(command, client_tick, payload, keyword)?;
        self.ring.advance();
        Ok(())
    }

    /// Appends a frame carrying `keyword` verbatim without touching the
    /// ring. Only the connection-init frame uses this.
    pub fn append_frame_with_keyword(
        &mut self,
        command: Command,
        client_tick: u32,
        payload: &[u8],
        keyword: u8,
    ) -> Result<(), ProtocolError> {
        self.append_raw(command, client_tick, payload, keyword)
    }

    fn append_raw(
        &mut self,
        command: Command,
        client_tick: u32,
        payload: &[u8],
        keyword: u8,
    ) -> Result<(), ProtocolError> {
        if payload.len() > MAX_PAYLOAD_SIZE {
            return Err(ProtocolError::FrameTooLarge {
                size: HEADER_SIZE + payload.len(),
            });
        }

        let header = FrameHeader {
            total_size: (HEADER_SIZE + payload.len()) as u16,
            checksum: additive_checksum(payload),
            keyword,
            command: command.to_raw(),
            reserved: 0,
            client_tick,
        };

        let start = self.buf.len();
        self.buf.put_bytes(0, HEADER_SIZE);
        header.write(&mut self.buf[start..]);
        self.buf.extend_from_slice(payload);
        self.frames_encoded += 1;

        Ok(())
    }

    /// Takes all frames written so far.
    pub fn take(&mut self) -> BytesMut {
        self.buf.split()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Ring position for the send direction; `m % 16` after m frames.
    pub fn ring_position(&self) -> usize {
        self.ring.position()
    }

    pub fn frames_encoded(&self) -> u64 {
        self.frames_encoded
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::FrameHeader;

    #[test]
    fn eight_byte_payload_makes_a_twenty_byte_frame() {
        let mut enc = FrameEncoder::new();
        enc.append_frame(Command::Move, 0, &[1, 2, 3, 4, 5, 6, 7, 8])
            .unwrap();

        let bytes = enc.take();
        assert_eq!(bytes.len(), 20);

        let header = FrameHeader::parse(&bytes);
        assert_eq!(header.total_size, 20);
        assert_eq!(header.checksum, 36);
        assert_eq!(header.command, 0x0201);
    }

    #[test]
    fn oversize_payload_is_refused() {
        let mut enc = FrameEncoder::new();
        let err = enc
            .append_frame(Command::Chat, 0, &vec![0_u8; MAX_PAYLOAD_SIZE + 1])
            .unwrap_err();
        assert!(matches!(err, ProtocolError::FrameTooLarge { .. }));
        assert!(enc.is_empty());
        assert_eq!(enc.ring_position(), 0);
    }

    #[test]
    fn fixed_keyword_leaves_ring_untouched() {
        let mut enc = FrameEncoder::new();
        enc.append_frame_with_keyword(Command::Init, 0, &[], 0x55)
            .unwrap();
        assert_eq!(enc.ring_position(), 0);

        let bytes = enc.take();
        assert_eq!(FrameHeader::parse(&bytes).keyword, 0x55);
    }

    #[test]
    fn frames_stack_in_order() {
        let mut enc = FrameEncoder::new();
        enc.append_frame(Command::Chat, 1, b"a").unwrap();
        enc.append_frame(Command::Chat, 2, b"b").unwrap();

        let bytes = enc.take();
        let first = FrameHeader::parse(&bytes);
        assert_eq!(first.client_tick, 1);
        let second = FrameHeader::parse(&bytes[first.total_size as usize..]);
        assert_eq!(second.client_tick, 2);
        assert_eq!(enc.frames_encoded(), 2);
    }
}
