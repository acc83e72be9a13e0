use bytes::{Buf, BytesMut};
use tracing::debug;

use crate::frame::{additive_checksum, Frame, FrameHeader};
use crate::{Command, KeywordRing, ProtocolError, HEADER_SIZE, MAX_FRAME_SIZE};

/// Incremental frame decoder for one direction of one connection.
///
/// Bytes are queued as they arrive; [`try_next_frame`](Self::try_next_frame)
/// extracts complete frames. Corrupt frames are dropped and the cursor
/// resynced to the next declared boundary, so a single bad frame does not
/// poison the stream.
#[derive(Default)]
pub struct FrameDecoder {
    buf: BytesMut,
    ring: KeywordRing,
    corrupt_frames: u64,
    invalid_keywords: u64,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attempts to extract the next complete frame.
    ///
    /// Returns `Ok(None)` when more bytes are needed. A frame that fails
    /// the checksum is consumed and skipped internally. Keyword mismatches
    /// and out-of-protocol command codes consume the frame and surface the
    /// error so the caller can count it; calling again continues with the
    /// following frame.
    pub fn try_next_frame(&mut self) -> Result<Option<Frame>, ProtocolError> {
        loop {
            if self.buf.len() < HEADER_SIZE {
                return Ok(None);
            }

            let header = FrameHeader::parse(&self.buf);
            let total = header.total_size as usize;

            if total > MAX_FRAME_SIZE {
                // The declared boundary is untrustworthy. Drop everything
                // buffered; the peer is not speaking the protocol.
                self.buf.clear();
                self.corrupt_frames += 1;
                return Err(ProtocolError::FrameTooLarge { size: total });
            }

            if total < HEADER_SIZE {
                self.resync();
                self.corrupt_frames += 1;
                continue;
            }

            if self.buf.len() < total {
                // Incomplete frame. Need more data.
                return Ok(None);
            }

            let payload = &self.buf[HEADER_SIZE..total];

            if additive_checksum(payload) != header.checksum {
                debug!(
                    declared = header.checksum,
                    "dropping frame with bad checksum"
                );
                self.buf.advance(total);
                self.corrupt_frames += 1;
                continue;
            }

            let expected = self.ring.current();
            if header.keyword != expected {
                self.buf.advance(total);
                self.invalid_keywords += 1;
                return Err(ProtocolError::InvalidKeyword {
                    got: header.keyword,
                    expected,
                });
            }

            // The keyword matched, so the sender spent a ring slot on this
            // frame; spend ours before the command check or the rings
            // desync for the rest of the session.
            self.ring.advance();

            let Some(command) = Command::from_raw(header.command) else {
                self.buf.advance(total);
                self.corrupt_frames += 1;
                return Err(ProtocolError::UnknownCommand(header.command));
            };

            let mut data = self.buf.split_to(total);
            data.advance(HEADER_SIZE);

            return Ok(Some(Frame {
                command,
                client_tick: header.client_tick,
                body: data,
            }));
        }
    }

    /// Skips ahead one byte so the next parse attempt starts on fresh
    /// input. Used when the declared size itself is nonsense.
    fn resync(&mut self) {
        self.buf.advance(1);
    }

    pub fn queue_bytes(&mut self, bytes: BytesMut) {
        self.buf.unsplit(bytes);
    }

    pub fn queue_slice(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    pub fn take_capacity(&mut self) -> BytesMut {
        self.buf.split_off(self.buf.len())
    }

    pub fn reserve(&mut self, additional: usize) {
        self.buf.reserve(additional);
    }

    /// Ring position for the receive direction; `n % 16` after n frames.
    pub fn ring_position(&self) -> usize {
        self.ring.position()
    }

    /// Frames dropped for bad size or checksum.
    pub fn corrupt_frames(&self) -> u64 {
        self.corrupt_frames
    }

    /// Frames dropped for a keyword out of lockstep.
    pub fn invalid_keywords(&self) -> u64 {
        self.invalid_keywords
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::FrameEncoder;

    fn encode(cmd: Command, tick: u32, payload: &[u8]) -> BytesMut {
        let mut enc = FrameEncoder::new();
        enc.append_frame(cmd, tick, payload).unwrap();
        enc.take()
    }

    #[test]
    fn round_trip_advances_ring() {
        let mut dec = FrameDecoder::new();
        dec.queue_slice(&encode(Command::Move, 7, &[1, 2, 3, 4, 5, 6, 7, 8]));

        let frame = dec.try_next_frame().unwrap().expect("complete frame");
        assert_eq!(frame.command, Command::Move);
        assert_eq!(frame.client_tick, 7);
        assert_eq!(&frame.body[..], &[1, 2, 3, 4, 5, 6, 7, 8]);
        assert_eq!(dec.ring_position(), 1);
    }

    #[test]
    fn incomplete_frame_yields_none() {
        let mut dec = FrameDecoder::new();
        let bytes = encode(Command::Chat, 0, b"hello");
        dec.queue_slice(&bytes[..bytes.len() - 1]);

        assert!(dec.try_next_frame().unwrap().is_none());

        dec.queue_slice(&bytes[bytes.len() - 1..]);
        assert!(dec.try_next_frame().unwrap().is_some());
    }

    #[test]
    fn bad_checksum_skips_to_next_frame() {
        let mut dec = FrameDecoder::new();
        let mut bad = encode(Command::Chat, 0, b"corrupt me");
        bad[HEADER_SIZE] ^= 0xFF;
        dec.queue_slice(&bad);

        // The good frame behind it still carries ring slot 0 from the
        // sender's point of view because the corrupt frame never counted.
        let good = encode(Command::Move, 3, &[9]);
        dec.queue_slice(&good);

        let frame = dec.try_next_frame().unwrap().expect("resynced frame");
        assert_eq!(frame.command, Command::Move);
        assert_eq!(dec.corrupt_frames(), 1);
    }

    #[test]
    fn keyword_out_of_lockstep_is_rejected() {
        let mut enc = FrameEncoder::new();
        enc.append_frame(Command::Chat, 0, b"a").unwrap();
        enc.take();
        // Second frame carries ring slot 1; a fresh decoder expects slot 0.
        enc.append_frame(Command::Chat, 0, b"b").unwrap();

        let mut dec = FrameDecoder::new();
        dec.queue_slice(&enc.take());

        assert!(matches!(
            dec.try_next_frame(),
            Err(ProtocolError::InvalidKeyword { .. })
        ));
        assert_eq!(dec.invalid_keywords(), 1);
    }

    #[test]
    fn unknown_command_is_rejected_without_desyncing_the_ring() {
        let mut enc = FrameEncoder::new();
        enc.append_frame(Command::Chat, 0, b"x").unwrap();
        let mut bytes = enc.take();
        // Patch in a code outside the protocol and leave the keyword slot
        // untouched (command is not covered by the checksum).
        bytes[4] = 0xFF;
        bytes[5] = 0x7F;

        let mut dec = FrameDecoder::new();
        dec.queue_slice(&bytes);
        assert!(matches!(
            dec.try_next_frame(),
            Err(ProtocolError::UnknownCommand(0x7FFF))
        ));

        // The frame passed the keyword check, so it consumed a slot on
        // both ends; the next frame from the same sender still decodes.
        assert_eq!(dec.ring_position(), 1);
        enc.append_frame(Command::Move, 1, &[9]).unwrap();
        dec.queue_slice(&enc.take());

        let frame = dec
            .try_next_frame()
            .unwrap()
            .expect("frame after unknown command");
        assert_eq!(frame.command, Command::Move);
        assert_eq!(dec.ring_position(), 2);
    }

    #[test]
    fn max_frame_accepted_oversize_rejected() {
        let mut dec = FrameDecoder::new();
        dec.queue_slice(&encode(Command::Chat, 0, &vec![0_u8; MAX_FRAME_SIZE - HEADER_SIZE]));
        assert!(dec.try_next_frame().unwrap().is_some());

        // 8193 declared: rejected outright.
        let mut raw = [0_u8; HEADER_SIZE];
        FrameHeader {
            total_size: (MAX_FRAME_SIZE + 1) as u16,
            checksum: 0,
            keyword: 0,
            command: 0x0101,
            reserved: 0,
            client_tick: 0,
        }
        .write(&mut raw);
        dec.queue_slice(&raw);
        assert!(matches!(
            dec.try_next_frame(),
            Err(ProtocolError::FrameTooLarge { size }) if size == MAX_FRAME_SIZE + 1
        ));
    }

    #[test]
    fn ring_positions_track_frame_counts() {
        let mut enc = FrameEncoder::new();
        let mut dec = FrameDecoder::new();

        for n in 0_usize..40 {
            enc.append_frame(Command::Move, n as u32, &[n as u8]).unwrap();
            dec.queue_slice(&enc.take());
            dec.try_next_frame().unwrap().unwrap();
            assert_eq!(enc.ring_position(), (n + 1) % 16);
            assert_eq!(dec.ring_position(), (n + 1) % 16);
        }
    }
}
