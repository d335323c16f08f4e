//! A small ring buffer of decoder snapshots, one per edge interrupt.
//!
//! Invaluable when staring at a misread frame: the trace shows, for each
//! of the most recent edge events, the measured interval, the jitter
//! carry before and after, the decoded bit count, and the state
//! transition the event caused.

use crate::frame::RxState;
use crate::BusLevel;

/// Number of edge events kept.
pub const EDGE_TRACE_DEPTH: usize = 32;

/// One decoder snapshot, recorded exactly once per edge event.
#[derive(Debug, Clone, Copy)]
pub struct EdgeSample {
    /// Level the bus changed to.
    pub level: BusLevel,
    /// Cycles since the previous edge.
    pub n_cycles: u32,
    /// Jitter carry going into the event.
    pub jitter_in: u32,
    /// Jitter carry left behind by the event.
    pub jitter_out: u32,
    /// Decoded run length, in bits (0 when the event did not decode).
    pub n_bits: u32,
    /// Slot state before the event.
    pub from_state: RxState,
    /// Slot state after the event.
    pub to_state: RxState,
    /// Bit position within the current 10-bit group, after the event.
    pub at_bit: u8,
    /// Raw accumulated group bits, after the event.
    pub read_bits: u16,
}

impl EdgeSample {
    /// An all-zero sample, for pre-filling buffers handed to
    /// [`VanBus::edge_trace`](crate::VanBus::edge_trace).
    pub const fn empty() -> Self {
        Self {
            level: BusLevel::Recessive,
            n_cycles: 0,
            jitter_in: 0,
            jitter_out: 0,
            n_bits: 0,
            from_state: RxState::Vacant,
            to_state: RxState::Vacant,
            at_bit: 0,
            read_bits: 0,
        }
    }
}

pub(crate) struct EdgeTrace {
    samples: [EdgeSample; EDGE_TRACE_DEPTH],
    at: usize,
    len: usize,
}

impl EdgeTrace {
    pub(crate) const fn new() -> Self {
        Self {
            samples: [EdgeSample::empty(); EDGE_TRACE_DEPTH],
            at: 0,
            len: 0,
        }
    }

    pub(crate) fn record(&mut self, sample: EdgeSample) {
        self.samples[self.at] = sample;
        self.at = (self.at + 1) % EDGE_TRACE_DEPTH;
        if self.len < EDGE_TRACE_DEPTH {
            self.len += 1;
        }
    }

    /// Copy the most recent samples into `out`, oldest first. Returns the
    /// number of samples written.
    pub(crate) fn copy_to(&self, out: &mut [EdgeSample]) -> usize {
        let n = self.len.min(out.len());
        for (i, slot) in out[..n].iter_mut().enumerate() {
            // Walk backwards from the write position by the n..1 most
            // recent entries.
            let idx = (self.at + EDGE_TRACE_DEPTH - n + i) % EDGE_TRACE_DEPTH;
            *slot = self.samples[idx];
        }
        n
    }
}
