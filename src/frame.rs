//! Wire frame layout, Enhanced-Manchester bit stuffing, and the RX/TX
//! frame descriptors.
//!
//! Frame layout, MSB-first on the wire, 10 transmitted bits per byte
//! (each nibble is followed by the complement of its last bit as a
//! Manchester check bit):
//!
//! | field     | bytes   | notes                                       |
//! |-----------|---------|---------------------------------------------|
//! | SOF       | 1       | always 0x0E (wire pattern 0x03D)            |
//! | IDEN      | 1.5     | 12-bit identifier                           |
//! | COM       | 0.5     | fixed-1 bit, RAK, R/W, RTR                  |
//! | DATA      | 0..28   | payload                                     |
//! | CRC + EOD | 2       | 15-bit CRC << 1; EOD forces the last 2 bits |
//!
//! followed on the wire by 2 ACK slots and 8 EOF slots (all recessive
//! unless a receiver pulls the first ACK slot dominant).

use heapless::Vec;

use crate::crc;

/// Start-of-frame byte value.
pub const SOF_BYTE: u8 = 0x0E;

/// The canonical 10-bit wire pattern of the SOF byte.
pub const SOF_PATTERN: u16 = 0x03D;

// Patterns accepted as SOF when hunting for a frame. The two near misses
// (one bit off, at positions where interrupt latency is known to smear
// the edge) measurably reduce the miss rate on a live bus.
pub(crate) const SOF_ACCEPTED: [u16; 3] = [0x03D, 0x01D, 0x13D];

/// Maximum payload length.
pub const MAX_DATA_BYTES: usize = 28;

/// Maximum whole-frame length: SOF + IDEN + COM + data + CRC/EOD.
pub const MAX_FRAME_BYTES: usize = 33;

// Stuffed groups for a full frame, plus one trailer word of recessive
// ACK/EOF bits.
pub(crate) const MAX_STUFFED_GROUPS: usize = MAX_FRAME_BYTES + 1;

/// Expand a byte to its 10-bit wire pattern: high nibble, check bit,
/// low nibble, check bit.
pub fn stuff(byte: u8) -> u16 {
    let b = byte as u16;
    let nb = !byte as u16;
    (b & 0xF0) << 2 | (nb & 0x10) << 1 | (b & 0x0F) << 1 | (nb & 0x01)
}

/// Drop the two check bits out of a 10-bit group.
pub fn unstuff(group: u16) -> u8 {
    (group >> 2 & 0xF0) as u8 | (group >> 1 & 0x0F) as u8
}

/// Build the stuffed wire image of a frame: SOF, IDEN, COM, data, CRC,
/// with the EOD marker forced into the last group and one trailing word
/// of 10 recessive bits (2 ACK slots + 8 EOF slots).
///
/// `data` is truncated to [`MAX_DATA_BYTES`].
pub fn stuff_frame(iden: u16, flags: u8, data: &[u8]) -> Vec<u16, MAX_STUFFED_GROUPS> {
    let data = &data[..data.len().min(MAX_DATA_BYTES)];
    let n = data.len() + 5;

    let mut bytes = [0u8; MAX_FRAME_BYTES];
    bytes[0] = SOF_BYTE;
    bytes[1] = (iden >> 4) as u8;
    bytes[2] = (iden << 4) as u8 | 0x08 | (flags & 0x07);
    bytes[3..3 + data.len()].copy_from_slice(data);
    let crc = crc::frame_crc(&bytes[..n]);
    bytes[n - 2] = (crc >> 8) as u8;
    bytes[n - 1] = (crc & 0xFF) as u8;

    let mut stuffed = Vec::new();
    for &byte in &bytes[..n] {
        // Cannot overflow: n <= MAX_FRAME_BYTES, capacity is one more
        let _ = stuffed.push(stuff(byte));
    }

    // The CRC's last bit is always 0 (15 bits shifted left), and forcing
    // its check bit to 0 as well yields the EOD marker.
    stuffed[n - 1] &= 0xFFFC;

    let _ = stuffed.push(0xFFFF);
    stuffed
}

/// Decoder state of an RX frame slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt-logging", derive(defmt::Format))]
pub enum RxState {
    /// Slot is free; no frame in progress.
    Vacant,
    /// A dominant edge was seen; hunting for the SOF pattern.
    Searching,
    /// SOF matched; accumulating 10-bit groups.
    Loading,
    /// EOD seen; watching for the ACK slot.
    WaitingAck,
    /// Frame complete, waiting to be read by the consumer.
    Done,
}

/// Terminal decode outcome of a received frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt-logging", derive(defmt::Format))]
pub enum RxResult {
    /// Frame was decoded cleanly (which does not imply the CRC is valid).
    Ok,
    /// An implausibly long equal-level run was measured mid-frame.
    ErrorNBits,
    /// The frame exceeded the maximum length before an EOD was seen.
    ErrorMaxPacket,
}

/// Whether a receiver pulled the ACK slot dominant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt-logging", derive(defmt::Format))]
pub enum Ack {
    /// ACK slot was pulled dominant.
    Ack,
    /// ACK slot stayed recessive.
    NoAck,
}

/// A received frame: the raw bytes (SOF through CRC) plus reception
/// metadata.
///
/// Accessors that slice into the frame return empty/zero values for
/// frames too short to contain the field; such frames carry an error
/// [`result`](Self::result).
#[derive(Debug, Clone)]
pub struct RxFrame {
    pub(crate) bytes: Vec<u8, MAX_FRAME_BYTES>,
    pub(crate) state: RxState,
    pub(crate) result: RxResult,
    pub(crate) ack: Ack,
    pub(crate) seq_no: u32,
    pub(crate) millis: u32,
    pub(crate) uncertain_bit: Option<u16>,
}

impl RxFrame {
    /// An empty frame, ready to be filled by [`receive`](crate::VanBus::receive).
    pub const fn new() -> Self {
        Self {
            bytes: Vec::new(),
            state: RxState::Vacant,
            result: RxResult::Ok,
            ack: Ack::NoAck,
            seq_no: 0,
            millis: 0,
            uncertain_bit: None,
        }
    }

    pub(crate) fn init(&mut self) {
        self.bytes.clear();
        self.state = RxState::Vacant;
        self.result = RxResult::Ok;
        self.ack = Ack::NoAck;
        self.uncertain_bit = None;
    }

    /// The 12-bit identifier field.
    pub fn iden(&self) -> u16 {
        if self.bytes.len() < 3 {
            return 0;
        }
        (self.bytes[1] as u16) << 4 | (self.bytes[2] as u16) >> 4
    }

    /// The 4-bit COM field. Bit 3 is always 1; bit 2 is RAK (ack
    /// requested), bit 1 is R/W (1 = read), bit 0 is RTR (request for
    /// in-frame response, only meaningful when R/W is 1).
    pub fn command_flags(&self) -> u8 {
        if self.bytes.len() < 3 {
            return 0;
        }
        self.bytes[2] & 0x0F
    }

    /// The payload bytes.
    pub fn data(&self) -> &[u8] {
        if self.bytes.len() < 5 {
            return &[];
        }
        &self.bytes[3..self.bytes.len() - 2]
    }

    /// Payload length in bytes.
    pub fn data_len(&self) -> usize {
        self.bytes.len().saturating_sub(5)
    }

    /// The CRC recomputed over the frame body, in wire representation.
    pub fn crc(&self) -> u16 {
        if self.bytes.len() < 5 {
            return 0;
        }
        crc::frame_crc(&self.bytes)
    }

    /// Whether the frame passes the CRC check as received.
    pub fn check_crc(&self) -> bool {
        crc::check(&self.bytes)
    }

    /// CRC check with the bounded repair search; see
    /// [`crc::check_and_repair`]. Prefer going through
    /// [`VanBus::check_crc_and_repair`](crate::VanBus::check_crc_and_repair)
    /// so the repair statistics are kept.
    pub fn check_crc_and_repair(&mut self) -> crc::Repair {
        let uncertain = self.uncertain_bit;
        crc::check_and_repair(&mut self.bytes, uncertain)
    }

    /// ACK slot outcome.
    pub fn ack(&self) -> Ack {
        self.ack
    }

    /// Terminal decode outcome.
    pub fn result(&self) -> RxResult {
        self.result
    }

    /// Sequence number, counting every completed frame including dropped
    /// and corrupt ones, so gaps are visible to the consumer.
    pub fn seq_no(&self) -> u32 {
        self.seq_no
    }

    /// Reception time stamp, in milliseconds.
    pub fn millis(&self) -> u32 {
        self.millis
    }

    /// The raw frame bytes, SOF through CRC.
    pub fn raw(&self) -> &[u8] {
        &self.bytes
    }
}

impl Default for RxFrame {
    fn default() -> Self {
        Self::new()
    }
}

/// Dumps the raw frame, e.g. `Raw: #0042 1(6) 0E 8A4 W-0 00:AB-CD NO_ACK OK 1ABC CRC_OK`.
impl core::fmt::Display for RxFrame {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(
            f,
            "Raw: #{:04} {:2}({:2}) ",
            self.seq_no % 10000,
            self.data_len(),
            self.bytes.len()
        )?;

        if self.bytes.len() >= 3 {
            let flags = self.command_flags();
            write!(
                f,
                "{:02X} {:03X} {}{}{} ",
                self.bytes[0],
                self.iden(),
                if flags & 0x02 != 0 { 'R' } else { 'W' },
                if flags & 0x04 != 0 { 'A' } else { '-' },
                flags & 0x01
            )?;
        }

        for (i, byte) in self.data().iter().enumerate() {
            let sep = if i == 0 { "" } else { "-" };
            write!(f, "{sep}{byte:02X}")?;
        }

        if self.bytes.len() >= 5 {
            let n = self.bytes.len();
            write!(f, ":{:02X}-{:02X} ", self.bytes[n - 2], self.bytes[n - 1])?;
        }

        write!(
            f,
            "{} {} {:04X} {}",
            match self.ack {
                Ack::Ack => "ACK",
                Ack::NoAck => "NO_ACK",
            },
            match self.result {
                RxResult::Ok => "OK",
                RxResult::ErrorNBits => "ERROR_NBITS",
                RxResult::ErrorMaxPacket => "ERROR_MAX_PACKET",
            },
            self.crc(),
            if self.check_crc() { "CRC_OK" } else { "CRC_ERROR" }
        )
    }
}

/// TX slot state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt-logging", derive(defmt::Format))]
pub(crate) enum TxState {
    /// Prepared, waiting for the bus to become free.
    Waiting,
    /// Bits are going out.
    Sending,
    /// Transmitted (or never used); the slot may be reused.
    Done,
}

/// A frame prepared for transmission, as stuffed 10-bit groups, plus
/// per-transmission diagnostics.
#[derive(Debug, Clone)]
pub(crate) struct TxFrame {
    pub(crate) stuffed: Vec<u16, MAX_STUFFED_GROUPS>,
    /// Index of the first group past the EOD; collision/bit-error
    /// detection stops here, otherwise the receiver's ACK pulse would be
    /// taken for a collision.
    pub(crate) eod_at: usize,
    pub(crate) state: TxState,
    pub(crate) seq_no: u32,
    pub(crate) n_collisions: u32,
    pub(crate) first_collision_at_bit: u32,
    pub(crate) bit_error: bool,
    pub(crate) bit_ok: bool,
    pub(crate) bus_occupied: bool,
    pub(crate) inter_frame_cycles: u32,
}

impl TxFrame {
    pub(crate) const fn new() -> Self {
        Self {
            stuffed: Vec::new(),
            eod_at: 0,
            state: TxState::Done,
            seq_no: 0,
            n_collisions: 0,
            first_collision_at_bit: 0,
            bit_error: false,
            bit_ok: false,
            bus_occupied: false,
            inter_frame_cycles: 0,
        }
    }

    pub(crate) fn prepare(&mut self, iden: u16, flags: u8, data: &[u8]) {
        self.stuffed = stuff_frame(iden, flags, data);
        self.eod_at = self.stuffed.len() - 1;
        self.n_collisions = 0;
        self.first_collision_at_bit = 0;
        self.bit_error = false;
        self.bit_ok = false;
        self.bus_occupied = false;
        self.inter_frame_cycles = 0;
        self.state = TxState::Waiting;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sof_stuffs_to_its_wire_pattern() {
        assert_eq!(stuff(SOF_BYTE), SOF_PATTERN);
    }

    #[test]
    fn stuff_unstuff_roundtrip() {
        for byte in [0x00, 0x01, 0x0E, 0x55, 0xA5, 0xF0, 0xFF] {
            let group = stuff(byte);
            assert!(group < 1 << 10);
            assert_eq!(unstuff(group), byte);
        }
    }

    #[test]
    fn check_bits_complement_nibble_ends() {
        // 0xFF: both check bits must be 0; 0x00: both must be 1.
        assert_eq!(stuff(0xFF), 0b11110_11110);
        assert_eq!(stuff(0x00), 0b00001_00001);
    }

    #[test]
    fn stuffed_frame_layout() {
        let stuffed = stuff_frame(0x8A4, 0x08, &[0x00]);
        // SOF + IDEN(1.5) + COM(0.5) + 1 data + CRC(2) = 6 groups + trailer
        assert_eq!(stuffed.len(), 7);
        assert_eq!(stuffed[0], SOF_PATTERN);
        // EOD: the last two bits of the final CRC group are forced to 0
        assert_eq!(stuffed[5] & 0x003, 0);
        assert_eq!(stuffed[6], 0xFFFF);

        // Unstuffing the groups must give back a CRC-valid frame.
        let mut bytes = [0u8; 6];
        for (i, &group) in stuffed[..6].iter().enumerate() {
            bytes[i] = unstuff(group);
        }
        assert_eq!(bytes[0], SOF_BYTE);
        assert!(crate::crc::check(&bytes));
    }

    #[test]
    fn stuffed_frame_iden_and_flags() {
        let stuffed = stuff_frame(0x8A4, 0x08, &[0x12, 0x34]);
        assert_eq!(unstuff(stuffed[1]), 0x8A);
        // IDEN low nibble, the fixed-1 bit, COM bits
        assert_eq!(unstuff(stuffed[2]), 0x48);
    }

    #[test]
    fn oversize_payload_is_truncated() {
        let data = [0u8; 40];
        let stuffed = stuff_frame(0x123, 0x0C, &data);
        assert_eq!(stuffed.len(), MAX_STUFFED_GROUPS);
    }

    #[test]
    fn rx_accessors() {
        let mut frame = RxFrame::new();
        frame
            .bytes
            .extend_from_slice(&[0x0E, 0x8A, 0x4C, 0x11, 0x22, 0xAA, 0xBB])
            .unwrap();
        assert_eq!(frame.iden(), 0x8A4);
        assert_eq!(frame.command_flags(), 0x0C);
        assert_eq!(frame.data(), &[0x11, 0x22]);
        assert_eq!(frame.data_len(), 2);
    }

    #[test]
    fn short_frame_accessors_are_safe() {
        let mut frame = RxFrame::new();
        frame.bytes.extend_from_slice(&[0x0E, 0x8A]).unwrap();
        assert_eq!(frame.iden(), 0);
        assert_eq!(frame.data(), &[]);
        assert_eq!(frame.data_len(), 0);
        assert!(!frame.check_crc());
    }

    #[test]
    fn display_dumps_raw_bytes() {
        let mut frame = RxFrame::new();
        let stuffed = stuff_frame(0x8A4, 0x08, &[0x00]);
        for &group in &stuffed[..stuffed.len() - 1] {
            frame.bytes.push(unstuff(group)).unwrap();
        }
        frame.seq_no = 42;
        let s = format!("{frame}");
        assert!(s.starts_with("Raw: #0042  1( 6) 0E 8A4 W-0 00:"), "{s}");
        assert!(s.ends_with("CRC_OK"), "{s}");
    }
}
