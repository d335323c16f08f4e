//! The 15-bit frame CRC and the bounded bit-flip repair search.
//!
//! The polynomial and residue are fixed by the bus standard. The repair
//! search exploits two facts: the decoder knows which single bit it was
//! least sure about, and physical corruption almost always hits bits at
//! level transitions, where a late interrupt can shift an edge.

const CRC_POLYNOM: u16 = 0x0F9D;
const CRC_RESIDUE: u16 = 0x19B7;

fn feed(mut crc16: u16, mut byte: u8) -> u16 {
    for _ in 0..8 {
        let mut bit = crc16 & 0x4000;
        if byte & 0x80 != 0 {
            bit ^= 0x4000;
        }
        byte <<= 1;
        crc16 <<= 1;
        if bit != 0 {
            crc16 ^= CRC_POLYNOM;
        }
    }
    crc16
}

/// CRC over a frame body, in the form it is placed on the wire: skips the
/// SOF byte and the CRC field itself, inverts, and shifts the 15-bit value
/// into the top of the 16-bit field.
pub fn frame_crc(bytes: &[u8]) -> u16 {
    let mut crc16: u16 = 0x7FFF;
    for &byte in &bytes[1..bytes.len() - 2] {
        crc16 = feed(crc16, byte);
    }
    crc16 ^= 0x7FFF;
    crc16 << 1
}

/// Whole-frame check, CRC field included: a valid frame leaves a fixed
/// residue.
pub fn check(bytes: &[u8]) -> bool {
    if bytes.len() < 5 {
        return false;
    }
    let mut crc16: u16 = 0x7FFF;
    for &byte in &bytes[1..] {
        crc16 = feed(crc16, byte);
    }
    crc16 & 0x7FFF == CRC_RESIDUE
}

/// Outcome of [`check_and_repair`], naming which stage of the search
/// succeeded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt-logging", derive(defmt::Format))]
pub enum Repair {
    /// The CRC was already valid; nothing was touched.
    Clean,
    /// Flipping the bit the decoder flagged as uncertain made the CRC
    /// valid.
    UncertainBit,
    /// A single bit flip made the CRC valid.
    OneBit,
    /// Flipping two adjacent bits within one byte made the CRC valid.
    TwoConsecutive,
    /// Flipping two separate boundary bits made the CRC valid.
    TwoSeparate,
    /// No repair within the search bounds; the frame stays as received
    /// (minus the flips, which are all undone).
    Failed,
}

impl Repair {
    /// True unless the search exhausted without finding a valid frame.
    pub fn is_ok(self) -> bool {
        self != Repair::Failed
    }
}

/// Try to make `bytes` CRC-valid with at most two bit flips.
///
/// Stages, cheapest and most likely first:
/// 1. the decoder's uncertain bit, if any (`uncertain` is an absolute bit
///    index, `byte * 8 + bit` with bit 0 the LSB);
/// 2. every single bit, and every pair of adjacent bits within a byte;
/// 3. every pair of boundary bits (bits sitting at a level transition on
///    the wire).
///
/// On success the repaired bytes are left in place; on failure every flip
/// has been undone.
pub fn check_and_repair(bytes: &mut [u8], uncertain: Option<u16>) -> Repair {
    if check(bytes) {
        return Repair::Clean;
    }

    if let Some(at) = uncertain {
        let at_byte = (at / 8) as usize;
        let mask = 1u8 << (at % 8);
        if at_byte > 0 && at_byte < bytes.len() {
            bytes[at_byte] ^= mask;
            if check(bytes) {
                return Repair::UncertainBit;
            }
            bytes[at_byte] ^= mask;
        }
    }

    for at_byte in 1..bytes.len() {
        for at_bit in 0..8 {
            let mask = 1u8 << at_bit;
            bytes[at_byte] ^= mask;

            if check(bytes) {
                return Repair::OneBit;
            }

            if at_bit != 7 {
                let mask2 = 1u8 << (at_bit + 1);
                bytes[at_byte] ^= mask2;
                if check(bytes) {
                    return Repair::TwoConsecutive;
                }
                bytes[at_byte] ^= mask2;
            }

            bytes[at_byte] ^= mask;
        }
    }

    let n_bits = bytes.len() * 8;
    for at1 in 8..n_bits {
        if !is_boundary_bit(bytes, at1) {
            continue;
        }
        let mask1 = 1u8 << (at1 % 8);
        bytes[at1 / 8] ^= mask1;

        for at2 in (at1 + 1)..n_bits {
            if !is_boundary_bit(bytes, at2) {
                continue;
            }
            let mask2 = 1u8 << (at2 % 8);
            bytes[at2 / 8] ^= mask2;
            if check(bytes) {
                return Repair::TwoSeparate;
            }
            bytes[at2 / 8] ^= mask2;
        }

        bytes[at1 / 8] ^= mask1;
    }

    Repair::Failed
}

/// A bit is a boundary bit when it differs from the bit transmitted just
/// before it. In wire order each nibble is followed by the complement of
/// its last bit as a Manchester check bit, so:
/// - bit 7 follows the check bit after the previous byte (complement of
///   that byte's bit 0);
/// - bit 3 follows the check bit after the high nibble (complement of
///   bit 4);
/// - every other bit follows its numerically next-higher neighbour.
fn is_boundary_bit(bytes: &[u8], at: usize) -> bool {
    let byte = at / 8;
    let bit = at % 8;
    let val = bytes[byte] >> bit & 1;
    let prev = match bit {
        7 => !bytes[byte - 1] & 1,
        3 => !(bytes[byte] >> 4) & 1,
        b => bytes[byte] >> (b + 1) & 1,
    };
    val != prev
}
