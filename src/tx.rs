//! The transmit path: a periodic bit-tick emitter with carrier sense and
//! collision detection, feeding from a circular queue of prepared frames.
//!
//! The engine never touches hardware. Each tick it is handed the current
//! RX pin level and answers with the level to drive, so the facade owns
//! all GPIO access and the engine stays host-testable.

use crate::frame::{TxFrame, TxState};
use crate::BusLevel;

/// Counters kept by the transmit path. Diagnostic only; all roll over.
#[derive(Debug, Clone, Copy, Default)]
#[cfg_attr(feature = "defmt-logging", derive(defmt::Format))]
pub struct TxStats {
    /// Frames accepted for transmission.
    pub count: u32,
    /// Submissions refused because the queue stayed full past the
    /// caller's timeout.
    pub dropped: u32,
    /// Frames that went out after exactly one collision retry.
    pub single_collisions: u32,
    /// Frames that needed more than one retry.
    pub multiple_collisions: u32,
}

impl TxStats {
    const fn new() -> Self {
        Self {
            count: 0,
            dropped: 0,
            single_collisions: 0,
            multiple_collisions: 0,
        }
    }
}

/// What one bit tick decided.
pub(crate) struct TxTick {
    /// Level to drive onto the bus, if any.
    pub(crate) drive: Option<BusLevel>,
    /// A frame transmission started with this tick; stop listening to
    /// our own edges.
    pub(crate) started: bool,
    /// The frame finished with this tick; resume listening.
    pub(crate) finished: bool,
}

impl TxTick {
    const IDLE: Self = Self {
        drive: None,
        started: false,
        finished: false,
    };
}

pub(crate) struct TxEngine<const N: usize> {
    slots: [TxFrame; N],
    /// Producer position.
    head: usize,
    /// Transmitter position (advanced from the timer interrupt).
    tail: usize,
    /// Bit within the current 10-bit group, 9 down to 0.
    at_bit: u32,
    at_group: usize,
    last_set_level: BusLevel,
    /// One bus bit in CPU cycles, for the carrier-sense window.
    bit_cycles: u32,
    stats: TxStats,
}

impl<const N: usize> TxEngine<N> {
    const DONE: TxFrame = TxFrame::new();

    pub(crate) const fn new(bit_cycles: u32) -> Self {
        Self {
            slots: [Self::DONE; N],
            head: 0,
            tail: 0,
            at_bit: 9,
            at_group: 0,
            last_set_level: BusLevel::Recessive,
            bit_cycles,
            stats: TxStats::new(),
        }
    }

    pub(crate) fn slot_available(&self) -> bool {
        self.slots[self.head].state == TxState::Done
    }

    /// Prepare the head slot and queue it. Returns the slot index so a
    /// synchronous sender can watch for its completion.
    pub(crate) fn enqueue(&mut self, iden: u16, flags: u8, data: &[u8]) -> Option<usize> {
        if !self.slot_available() {
            return None;
        }
        let at = self.head;
        self.slots[at].prepare(iden, flags, data);
        self.slots[at].seq_no = self.stats.count;
        self.stats.count = self.stats.count.wrapping_add(1);
        self.head = (at + 1) % N;
        Some(at)
    }

    pub(crate) fn slot_done(&self, at: usize) -> bool {
        self.slots[at].state == TxState::Done
    }

    /// Anything left to send?
    pub(crate) fn pending(&self) -> bool {
        self.slots[self.tail].state != TxState::Done
    }

    pub(crate) fn note_dropped(&mut self) {
        self.stats.dropped = self.stats.dropped.wrapping_add(1);
    }

    /// One bit-timer tick. `pin` is the RX pin level read at tick entry,
    /// `curr` the cycle counter, `last_media_access_at` the RX engine's
    /// stamp of the last dominant-to-recessive transition.
    pub(crate) fn bit_tick(&mut self, pin: BusLevel, curr: u32, last_media_access_at: u32) -> TxTick {
        let t = self.tail;
        if self.slots[t].state == TxState::Done {
            return TxTick::IDLE;
        }

        let mut started = false;
        if self.slots[t].state == TxState::Waiting {
            // Carrier sense: wait out 8 EOF + 5 IFS bit times after the
            // last media access before claiming the bus.
            let n_cycles = curr.wrapping_sub(last_media_access_at);
            if n_cycles < (8 + 5) * self.bit_cycles {
                self.slots[t].bus_occupied = true;
                return TxTick::IDLE;
            }

            self.slots[t].inter_frame_cycles = n_cycles;
            self.slots[t].state = TxState::Sending;
            self.at_bit = 9;
            self.at_group = 0;
            started = true;
        }

        let slot = &mut self.slots[t];

        // Check that the previously driven bit made it onto the wire.
        // Only up to EOD: past it, the receiver's ACK pulse would look
        // like a collision.
        if self.at_group < slot.eod_at {
            if pin == BusLevel::Dominant && self.last_set_level == BusLevel::Recessive {
                van_warn!("tx collision");
                if slot.n_collisions == 0 {
                    slot.first_collision_at_bit =
                        self.at_group as u32 * 10 + (9 - self.at_bit);
                }
                slot.n_collisions = slot.n_collisions.wrapping_add(1);

                // Somebody else is driving; back off and re-arbitrate
                // from the top on the next tick.
                slot.state = TxState::Waiting;
            }

            // The opposite surprise is diagnostic only.
            if pin == BusLevel::Recessive && self.last_set_level == BusLevel::Dominant {
                slot.bit_error = true;
            }

            if pin == self.last_set_level {
                slot.bit_ok = true;
            }
        }

        let group = slot.stuffed[self.at_group];
        let drive = if group & (1 << self.at_bit) != 0 {
            BusLevel::Recessive
        } else {
            BusLevel::Dominant
        };
        self.last_set_level = drive;

        let mut finished = false;
        if self.at_bit == 0 {
            self.at_bit = 9;
            self.at_group += 1;
            if self.at_group == slot.stuffed.len() {
                finished = true;
            }
        } else {
            self.at_bit -= 1;
        }

        if finished {
            self.finish();
        }

        TxTick {
            drive: Some(drive),
            started,
            finished,
        }
    }

    fn finish(&mut self) {
        let slot = &mut self.slots[self.tail];
        match slot.n_collisions {
            0 => {}
            1 => self.stats.single_collisions = self.stats.single_collisions.wrapping_add(1),
            _ => self.stats.multiple_collisions = self.stats.multiple_collisions.wrapping_add(1),
        }
        slot.state = TxState::Done;
        self.tail = (self.tail + 1) % N;
    }

    pub(crate) fn stats(&self) -> TxStats {
        self.stats
    }

    pub(crate) fn count(&self) -> u32 {
        self.stats.count
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::{stuff_frame, MAX_STUFFED_GROUPS};

    // 41 timer ticks of 0.2 µs, 16 cycles each at the 80 MHz reference
    const BIT_CYCLES: u32 = 41 * 16;

    /// Run ticks with the wire looped back (the pin reads whatever was
    /// last driven), collecting the driven levels as bits.
    fn run_to_completion<const N: usize>(tx: &mut TxEngine<N>, start: u32) -> Vec<bool> {
        let mut pin = BusLevel::Recessive;
        let mut curr = start;
        let mut bits = Vec::new();
        for _ in 0..4000 {
            let tick = tx.bit_tick(pin, curr, 0);
            curr = curr.wrapping_add(BIT_CYCLES);
            if let Some(level) = tick.drive {
                bits.push(level == BusLevel::Recessive);
                pin = level;
            }
            if tick.finished {
                return bits;
            }
        }
        panic!("transmission never finished");
    }

    fn expected_bits(iden: u16, flags: u8, data: &[u8]) -> Vec<bool> {
        let mut bits = Vec::new();
        for &group in stuff_frame(iden, flags, data).iter() {
            for b in (0..10).rev() {
                bits.push(group >> b & 1 == 1);
            }
        }
        bits
    }

    #[test]
    fn emits_the_stuffed_frame_msb_first() {
        let mut tx = TxEngine::<2>::new(BIT_CYCLES);
        assert!(tx.enqueue(0x8A4, 0x08, &[0x0F, 0x07]).is_some());
        assert!(tx.pending());

        let bits = run_to_completion(&mut tx, 1_000_000);
        assert_eq!(bits, expected_bits(0x8A4, 0x08, &[0x0F, 0x07]));
        assert!(!tx.pending());
        assert_eq!(tx.stats().count, 1);
        assert_eq!(tx.stats().single_collisions, 0);
    }

    #[test]
    fn defers_while_the_bus_is_busy() {
        let mut tx = TxEngine::<2>::new(BIT_CYCLES);
        tx.enqueue(0x123, 0x0C, &[]).unwrap();

        // Inside the 13-bit window after the last media access.
        let tick = tx.bit_tick(BusLevel::Recessive, 12 * BIT_CYCLES, 0);
        assert!(tick.drive.is_none());
        assert!(!tick.started);
        assert!(tx.pending());

        // Past the window.
        let tick = tx.bit_tick(BusLevel::Recessive, 14 * BIT_CYCLES, 0);
        assert!(tick.started);
        assert!(tick.drive.is_some());
    }

    #[test]
    fn collision_backs_off_and_retries() {
        let mut tx = TxEngine::<2>::new(BIT_CYCLES);
        tx.enqueue(0x8A4, 0x08, &[0x55]).unwrap();

        // First tick: the wire reads dominant although we have driven
        // nothing yet (last set level recessive) - somebody else talking.
        let tick = tx.bit_tick(BusLevel::Dominant, 1_000_000, 0);
        assert!(tick.started);
        assert!(!tick.finished);

        // The frame went back to waiting; with the bus long quiet it
        // restarts and completes cleanly.
        let bits = run_to_completion(&mut tx, 2_000_000);
        assert_eq!(bits, expected_bits(0x8A4, 0x08, &[0x55]));
        assert_eq!(tx.stats().single_collisions, 1);
        assert_eq!(tx.stats().multiple_collisions, 0);
    }

    #[test]
    fn queue_slots_and_order() {
        let mut tx = TxEngine::<2>::new(BIT_CYCLES);
        let first = tx.enqueue(0x100, 0x08, &[0x01]).unwrap();
        let second = tx.enqueue(0x200, 0x08, &[0x02]).unwrap();
        assert_ne!(first, second);
        assert!(tx.enqueue(0x300, 0x08, &[0x03]).is_none());
        assert!(!tx.slot_done(first));

        let bits = run_to_completion(&mut tx, 1_000_000);
        assert_eq!(bits, expected_bits(0x100, 0x08, &[0x01]));
        assert!(tx.slot_done(first));
        assert!(!tx.slot_done(second));
        assert!(tx.pending());

        // Head slot is free again.
        assert!(tx.enqueue(0x300, 0x08, &[0x03]).is_some());
    }

    #[test]
    fn oversize_payload_still_fits_the_slot() {
        let mut tx = TxEngine::<2>::new(BIT_CYCLES);
        tx.enqueue(0x456, 0x08, &[0xAB; 64]).unwrap();
        let bits = run_to_completion(&mut tx, 1_000_000);
        assert_eq!(bits.len(), MAX_STUFFED_GROUPS * 10);
    }
}
