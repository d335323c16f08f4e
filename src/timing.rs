//! Conversion of measured edge intervals (CPU cycles) into bus bit counts.
//!
//! The bus carries 125 kbit/s, which at the 80 MHz reference clock is a
//! nominal 640 cycles per bit. Real captures consistently measure slightly
//! longer bits, and interrupt latency smears edges in both directions, so
//! the conversion uses a calibrated band table with a jitter carry instead
//! of a plain divide. The numbers below are calibration data; treat them
//! as such.

/// One nominal bus bit, in reference-clock CPU cycles.
pub const NOMINAL_BIT_CYCLES: u32 = 667;

/// Intervals shorter than this are same-level glitches or spurious
/// interrupts, folded into the bit in progress.
pub const GLITCH_FLOOR_CYCLES: u32 = 400;

/// An edge arriving within this many cycles after EOD is a late Manchester
/// bit of the frame body, not the ACK pulse.
pub const ACK_EARLY_CYCLES: u32 = 500;

struct Band {
    /// Exclusive upper limit of the interval, in reference cycles.
    below: u32,
    /// Interval at which the edge arrived exactly on time; any excess is
    /// carried into the next interval as jitter.
    nominal: u32,
    bits: u32,
}

// Band edges found by looking at many bus captures. Note the asymmetry:
// each band reaches further above its nominal than below it, because a
// late interrupt stretches the measured interval more often than an early
// one shrinks it.
const BANDS: [Band; 5] = [
    Band { below: 1124, nominal: 800, bits: 1 },
    Band { below: 1744, nominal: 1380, bits: 2 },
    Band { below: 2383, nominal: 2100, bits: 3 },
    Band { below: 3045, nominal: 2655, bits: 4 },
    Band { below: 3665, nominal: 3300, bits: 5 },
];

/// Stateful cycles-to-bits converter.
///
/// Keeps the jitter carry between calls: when an edge arrives later than
/// the nominal time for the decoded bit count, the excess is added to the
/// next measured interval, so one late interrupt does not cascade into a
/// misread of the following bit.
pub struct BitTimeDecoder {
    factor: u32,
    jitter: u32,
}

impl BitTimeDecoder {
    /// `factor` scales all cycle constants to the actual CPU clock, as a
    /// multiple of the 80 MHz reference (e.g. 2 for 160 MHz).
    pub const fn new(factor: u32) -> Self {
        Self { factor, jitter: 0 }
    }

    /// Decode a measured interval into a number of equal-valued bits.
    ///
    /// Intervals beyond the table fall back to a divide with a fixed
    /// upward bias; that path is only reached by long dominant runs at
    /// end of frame and by framing errors.
    pub fn decode(&mut self, cycles: u32) -> u32 {
        let cycles = cycles.wrapping_add(self.jitter);
        self.jitter = 0;
        for band in &BANDS {
            if cycles < band.below * self.factor {
                let nominal = band.nominal * self.factor;
                if cycles > nominal {
                    self.jitter = cycles - nominal;
                }
                return band.bits;
            }
        }
        (cycles + 200 * self.factor) / (NOMINAL_BIT_CYCLES * self.factor)
    }

    /// Current jitter carry, in cycles.
    pub fn jitter(&self) -> u32 {
        self.jitter
    }

    /// Drop the carry, e.g. when starting to hunt for a new frame.
    pub fn reset(&mut self) {
        self.jitter = 0;
    }

    /// Force the carry, used by the swallowed-Manchester-bit correction.
    pub(crate) fn seed(&mut self, jitter: u32) {
        self.jitter = jitter;
    }

    pub(crate) fn factor(&self) -> u32 {
        self.factor
    }
}
