//! The receive path: an edge-event decoder state machine feeding a
//! circular queue of frame slots.
//!
//! Everything here runs in interrupt context, driven by
//! [`VanBus::on_pin_edge`](crate::VanBus::on_pin_edge) and the ack-wait
//! timeout, except the consumer-side queue accessors which the facade
//! calls with interrupts masked.

use crate::crc::Repair;
use crate::frame::{Ack, RxFrame, RxResult, RxState, MAX_FRAME_BYTES, SOF_ACCEPTED, SOF_PATTERN};
use crate::frame::unstuff;
use crate::timing::{BitTimeDecoder, ACK_EARLY_CYCLES, GLITCH_FLOOR_CYCLES, NOMINAL_BIT_CYCLES};
use crate::trace::{EdgeSample, EdgeTrace};
use crate::BusLevel;

/// Counters kept by the receive path. Diagnostic only; all roll over.
#[derive(Debug, Clone, Copy, Default)]
#[cfg_attr(feature = "defmt-logging", derive(defmt::Format))]
pub struct RxStats {
    /// Completed frames, including corrupt and dropped ones.
    pub count: u32,
    /// Frames that failed the CRC check on first inspection.
    pub corrupt: u32,
    /// Corrupt frames made valid by the repair search.
    pub repaired: u32,
    /// Repairs that flipped the decoder's uncertain bit.
    pub uncertain_bit_errors: u32,
    /// Repairs that flipped a single bit.
    pub one_bit_errors: u32,
    /// Repairs that flipped two adjacent bits.
    pub two_consecutive_bit_errors: u32,
    /// Repairs that flipped two separate boundary bits.
    pub two_separate_bit_errors: u32,
    /// Frames discarded by the drop policy.
    pub dropped: u32,
    /// Unread frames overwritten because the queue was full.
    pub overruns: u32,
    /// High-water mark of the queue fill level.
    pub max_queued: u32,
}

impl RxStats {
    const fn new() -> Self {
        Self {
            count: 0,
            corrupt: 0,
            repaired: 0,
            uncertain_bit_errors: 0,
            one_bit_errors: 0,
            two_consecutive_bit_errors: 0,
            two_separate_bit_errors: 0,
            dropped: 0,
            overruns: 0,
            max_queued: 0,
        }
    }
}

/// What the facade must do with the bit timer after an edge event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum EdgeOutcome {
    Continue,
    /// EOD was seen; arm the one-shot ack-wait timeout.
    ArmAckTimer,
    /// The "ACK" was a late Manchester bit; stop the ack-wait timeout.
    DisarmAckTimer,
    /// A frame completed (with an error result; clean frames complete
    /// from the ack-wait timeout instead).
    FrameDone,
}

pub(crate) struct RxEngine<const N: usize> {
    slots: [RxFrame; N],
    /// Producer position (written from interrupt context).
    head: usize,
    /// Consumer position.
    tail: usize,
    n_queued: usize,
    overrun: bool,

    timing: BitTimeDecoder,
    prev_level: BusLevel,
    prev_edge_at: u32,
    /// Bit position within the 10-bit group being accumulated.
    at_bit: u32,
    /// The group bits accumulated so far, MSB first.
    read_bits: u16,
    /// Cycle stamp of the last dominant-to-recessive transition; the
    /// transmitter's carrier sense reads this.
    last_media_access_at: u32,

    drop_threshold: usize,
    is_essential: Option<fn(&RxFrame) -> bool>,

    stats: RxStats,
    trace: EdgeTrace,
}

impl<const N: usize> RxEngine<N> {
    const VACANT: RxFrame = RxFrame::new();

    pub(crate) const fn new(factor: u32) -> Self {
        Self {
            slots: [Self::VACANT; N],
            head: 0,
            tail: 0,
            n_queued: 0,
            overrun: false,
            timing: BitTimeDecoder::new(factor),
            prev_level: BusLevel::Recessive,
            prev_edge_at: 0,
            at_bit: 0,
            read_bits: 0,
            last_media_access_at: 0,
            drop_threshold: N,
            is_essential: None,
            stats: RxStats::new(),
            trace: EdgeTrace::new(),
        }
    }

    /// Process one pin-change event. `curr` is the cycle counter captured
    /// at interrupt entry, `now_ms` a millisecond stamp for completed
    /// frames.
    pub(crate) fn pin_edge(&mut self, level: BusLevel, curr: u32, now_ms: u32) -> EdgeOutcome {
        let n_cycles = curr.wrapping_sub(self.prev_edge_at);

        // Spurious interrupt: too soon after the previous edge to be a
        // bit, fold it into the interval in progress.
        if n_cycles.wrapping_add(self.timing.jitter())
            < GLITCH_FLOOR_CYCLES * self.timing.factor()
        {
            return EdgeOutcome::Continue;
        }

        // Also spurious: an "edge" to the level we were already at.
        if level == self.prev_level {
            return EdgeOutcome::Continue;
        }
        self.prev_level = level;
        self.prev_edge_at = curr;

        // A change to recessive ends somebody's media access.
        if level == BusLevel::Recessive {
            self.last_media_access_at = curr;
        }

        let mut sample = EdgeSample {
            level,
            n_cycles,
            jitter_in: self.timing.jitter(),
            from_state: self.slots[self.head].state,
            ..EdgeSample::empty()
        };

        let outcome = self.decode(level, n_cycles, now_ms, &mut sample);

        sample.jitter_out = self.timing.jitter();
        sample.to_state = self.slots[self.head].state;
        sample.at_bit = self.at_bit as u8;
        sample.read_bits = self.read_bits;
        self.trace.record(sample);

        outcome
    }

    fn decode(
        &mut self,
        level: BusLevel,
        n_cycles: u32,
        now_ms: u32,
        sample: &mut EdgeSample,
    ) -> EdgeOutcome {
        let h = self.head;
        let factor = self.timing.factor();

        let mut state = self.slots[h].state;

        if state == RxState::Done {
            // The consumer is a full queue behind. Sacrifice the oldest
            // unread frame and keep decoding; the sticky flag tells the
            // consumer what happened.
            van_warn!("rx queue overrun");
            self.overrun = true;
            self.stats.overruns = self.stats.overruns.wrapping_add(1);
            self.n_queued = self.n_queued.saturating_sub(1);
            self.slots[h].init();
            // The queue was full, so the head slot was also the oldest
            // unread one; the consumer resumes one frame later.
            self.tail = (self.tail + 1) % N;
            state = RxState::Vacant;
        }

        match state {
            RxState::Vacant => {
                if level == BusLevel::Dominant {
                    // A dominant run begins; it may be an SOF.
                    self.slots[h].state = RxState::Searching;
                    self.slots[h].ack = Ack::NoAck;
                    self.slots[h].bytes.clear();
                    self.at_bit = 0;
                    self.read_bits = 0;
                    self.timing.reset();
                }
                EdgeOutcome::Continue
            }
            RxState::WaitingAck => {
                if n_cycles < ACK_EARLY_CYCLES * factor {
                    // Came too soon to be the ACK; it was a late
                    // Manchester bit, so this is not EOD after all.
                    self.at_bit = 0;
                    self.read_bits = 0;
                    self.slots[h].state = RxState::Loading;
                    EdgeOutcome::DisarmAckTimer
                } else {
                    self.slots[h].ack = Ack::Ack;
                    // The ack-wait timeout completes the frame.
                    EdgeOutcome::Continue
                }
            }
            RxState::Searching | RxState::Loading => {
                self.decode_bits(state, level, n_cycles, now_ms, sample)
            }
            // Normalized to Vacant above.
            RxState::Done => EdgeOutcome::Continue,
        }
    }

    fn decode_bits(
        &mut self,
        state: RxState,
        level: BusLevel,
        n_cycles: u32,
        now_ms: u32,
        sample: &mut EdgeSample,
    ) -> EdgeOutcome {
        let h = self.head;
        let factor = self.timing.factor();

        let mut n_bits = self.timing.decode(n_cycles);
        sample.n_bits = n_bits;

        // The stuffing guarantees at most 5 equal bits in a row (6 during
        // EOD), but a missed Manchester bit stretches a run, so accept up
        // to 10. Beyond that the frame is gone.
        if n_bits > 10 {
            if state == RxState::Searching {
                // Not a frame after all.
                self.slots[h].init();
                self.at_bit = 0;
                self.read_bits = 0;
                self.timing.reset();
                return EdgeOutcome::Continue;
            }

            self.slots[h].result = RxResult::ErrorNBits;
            self.complete_head(now_ms);
            return EdgeOutcome::FrameDone;
        }

        // A multi-bit run ending exactly at a Manchester position has
        // probably swallowed the check bit (the check bit always differs
        // from the bit before it, so a genuine run cannot end there).
        // Shorten the run and flag the bit as uncertain. Exception: a
        // dominant run ending at bit 10 is exactly how EOD appears, so
        // only the recessive variant is corrected there.
        if n_bits > 1
            && (self.at_bit + n_bits == 5
                || (self.at_bit + n_bits == 10 && level == BusLevel::Dominant))
        {
            n_bits -= 1;
            sample.n_bits = n_bits;

            let nominal = NOMINAL_BIT_CYCLES * factor * n_bits;
            let jitter = if n_cycles > nominal {
                n_cycles - nominal
            } else {
                ACK_EARLY_CYCLES * factor
            };
            self.timing.seed(jitter);

            // The shortened run now ends at wire position 3 or 8 of the
            // group, i.e. data bit 4 or 0 of the byte being accumulated.
            let bit = if self.at_bit + n_bits == 4 { 4 } else { 0 };
            self.slots[h].uncertain_bit =
                Some(self.slots[h].bytes.len() as u16 * 8 + bit);
        }

        self.at_bit += n_bits;
        self.read_bits <<= n_bits;
        if level == BusLevel::Dominant {
            // The run that just ended was recessive: logical 1.
            self.read_bits |= (1 << n_bits) - 1;
        }

        if self.at_bit < 10 {
            return EdgeOutcome::Continue;
        }

        self.at_bit -= 10;
        let mut group = self.read_bits >> self.at_bit;

        if state == RxState::Searching {
            if !SOF_ACCEPTED.contains(&group) {
                self.slots[h].state = RxState::Vacant;
                return EdgeOutcome::Continue;
            }
            // A near-miss pattern is still the SOF.
            group = SOF_PATTERN;
            self.slots[h].state = RxState::Loading;
        }

        self.read_bits &= (1 << self.at_bit) - 1;

        // Cannot overflow: completion is forced at MAX_FRAME_BYTES below.
        let _ = self.slots[h].bytes.push(unstuff(group));

        // EOD: both trailing bits of the group are 0, on a group
        // boundary, never within the first five bytes.
        if group & 0x003 == 0 && self.at_bit == 0 && self.slots[h].bytes.len() >= 5 {
            self.slots[h].state = RxState::WaitingAck;
            return EdgeOutcome::ArmAckTimer;
        }

        if self.slots[h].bytes.len() >= MAX_FRAME_BYTES {
            self.slots[h].result = RxResult::ErrorMaxPacket;
            self.complete_head(now_ms);
            return EdgeOutcome::FrameDone;
        }

        EdgeOutcome::Continue
    }

    /// The ack-wait timeout fired: the frame is complete, with or without
    /// its ACK.
    pub(crate) fn ack_timeout(&mut self, now_ms: u32) {
        if self.slots[self.head].state == RxState::WaitingAck {
            self.complete_head(now_ms);
        }
    }

    fn complete_head(&mut self, now_ms: u32) {
        let keep = {
            let head = &mut self.slots[self.head];
            head.millis = now_ms;
            head.state = RxState::Done;
            head.seq_no = self.stats.count;

            self.n_queued <= self.drop_threshold
                || self.is_essential.map_or(false, |f| f(head))
        };
        self.stats.count = self.stats.count.wrapping_add(1);

        if keep {
            self.head = (self.head + 1) % N;
            self.n_queued += 1;
            if self.n_queued as u32 > self.stats.max_queued {
                self.stats.max_queued = self.n_queued as u32;
            }
        } else {
            // Queue is filling up and this frame is expendable.
            van_debug!("rx frame dropped");
            self.stats.dropped = self.stats.dropped.wrapping_add(1);
            self.slots[self.head].init();
        }
    }

    pub(crate) fn available(&self) -> bool {
        self.slots[self.tail].state == RxState::Done
    }

    /// Copy the oldest unread frame into `pkt` and free its slot.
    pub(crate) fn receive_into(&mut self, pkt: &mut RxFrame) -> bool {
        if !self.available() {
            return false;
        }
        pkt.clone_from(&self.slots[self.tail]);
        self.slots[self.tail].init();
        self.tail = (self.tail + 1) % N;
        self.n_queued = self.n_queued.saturating_sub(1);
        true
    }

    /// Read and clear the sticky overrun flag.
    pub(crate) fn take_overrun(&mut self) -> bool {
        core::mem::replace(&mut self.overrun, false)
    }

    pub(crate) fn set_drop_policy(
        &mut self,
        start_dropping_at: usize,
        is_essential: Option<fn(&RxFrame) -> bool>,
    ) {
        self.drop_threshold = start_dropping_at;
        self.is_essential = is_essential;
    }

    pub(crate) fn record_repair(&mut self, outcome: Repair, counted: bool) {
        if !counted {
            return;
        }
        match outcome {
            Repair::Clean => return,
            Repair::Failed => {
                self.stats.corrupt = self.stats.corrupt.wrapping_add(1);
                return;
            }
            _ => {}
        }
        self.stats.corrupt = self.stats.corrupt.wrapping_add(1);
        self.stats.repaired = self.stats.repaired.wrapping_add(1);
        let counter = match outcome {
            Repair::UncertainBit => &mut self.stats.uncertain_bit_errors,
            Repair::OneBit => &mut self.stats.one_bit_errors,
            Repair::TwoConsecutive => &mut self.stats.two_consecutive_bit_errors,
            _ => &mut self.stats.two_separate_bit_errors,
        };
        *counter = counter.wrapping_add(1);
    }

    pub(crate) fn stats(&self) -> RxStats {
        self.stats
    }

    pub(crate) fn count(&self) -> u32 {
        self.stats.count
    }

    pub(crate) fn n_queued(&self) -> usize {
        self.n_queued
    }

    pub(crate) fn max_queued(&self) -> usize {
        self.stats.max_queued as usize
    }

    pub(crate) fn last_media_access_at(&self) -> u32 {
        self.last_media_access_at
    }

    pub(crate) fn set_last_media_access_at(&mut self, at: u32) {
        self.last_media_access_at = at;
    }

    pub(crate) fn trace_copy_to(&self, out: &mut [EdgeSample]) -> usize {
        self.trace.copy_to(out)
    }
}
