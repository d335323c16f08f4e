//! # Walnuss
//!
//! A software modem for the VAN bus, the twisted-pair body-control bus
//! found in some PSA vehicles. VAN runs at 125 kbit/s, uses dominant and
//! recessive wire levels like CAN (a recessive bit is a logical 1), and
//! carries CSMA/CD arbitration: any node may start transmitting when the
//! bus has been quiet long enough, and a node that reads back a dominant
//! level while driving recessive has lost arbitration and retries.
//!
//! This crate targets microcontrollers with no VAN peripheral at all.
//! Reception works purely from GPIO edge timing: a pin-change interrupt
//! reads the CPU cycle counter, converts the interval since the previous
//! edge into a run of equal bits, and feeds a small state machine that
//! hunts for the start-of-frame pattern, accumulates 10-bit groups,
//! strips the Manchester check bits, and detects end-of-data.
//! Transmission runs from a periodic hardware timer, one bit per tick,
//! while the same RX pin is sampled to detect collisions.
//!
//! ## Wire format
//!
//! Bytes are encoded as 10 bits ("Enhanced Manchester"): each nibble is
//! followed by the complement of its last bit, which guarantees a level
//! transition at least every five bit times. A frame is:
//!
//! SOF (0x0E) | IDEN (12 bits) | COM (4 bits) | 0..28 data bytes |
//! CRC15 + EOD | ACK slot (2 bits) | EOF (8 bits)
//!
//! The 15-bit CRC is transmitted shifted left by one; the resulting
//! always-zero bit plus its forced-zero check bit form the end-of-data
//! marker. See [`frame`] for the details and [`crc`] for the checksum
//! and its repair search.
//!
//! ## Hardware seams
//!
//! The engine is sans-io. A [`BusCfg`] implementation supplies the pin
//! pair ([`BusPins`]), the shared bit timer ([`BitTimer`]), the edge
//! interrupt control ([`EdgeInterrupt`]), a cycle/millisecond clock
//! ([`Clock`]), and the mutex flavour guarding the shared state. The
//! application binds them with [`VanBus::setup`], then routes the two
//! interrupts to [`VanBus::on_pin_edge`] and [`VanBus::on_bit_timer`].
//! Everything else is ordinary thread-context API: [`VanBus::receive`],
//! [`VanBus::send_packet`], statistics, and the decoder trace.
//!
//! Blocking submitters take a [`Delay`] per call instead of storing one,
//! so the same `VanBus` in a `static` can be driven from contexts with
//! different timing facilities.
//!
//! ## Timing calibration
//!
//! All cycle constants are relative to an 80 MHz reference clock;
//! [`BusCfg::CPU_F_FACTOR`] scales them for faster cores. The interval
//! band table in [`timing`] and the tolerated near-miss SOF patterns are
//! calibration data derived from live bus captures, not things to derive
//! from first principles.

#![cfg_attr(not(any(test, feature = "std")), no_std)]
#![warn(missing_docs)]

#[macro_use]
mod macros;

pub mod bus;
pub mod crc;
pub mod frame;
pub mod rx;
pub mod timing;
pub mod trace;
pub mod tx;

pub use bus::VanBus;
pub use frame::RxFrame;

use embassy_sync::blocking_mutex::raw::RawMutex;

/// Electrical state of the bus wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt-logging", derive(defmt::Format))]
pub enum BusLevel {
    /// The wire is actively driven; wins arbitration.
    Dominant,
    /// The wire is released; a logical 1.
    Recessive,
}

/// The RX/TX pin pair of the bus transceiver.
///
/// `read` must be cheap: it is called from both interrupt handlers.
pub trait BusPins {
    /// Sample the RX pin.
    fn read(&mut self) -> BusLevel;
    /// Drive the TX pin.
    fn write(&mut self, level: BusLevel);
}

/// Control over the pin-change interrupt delivery.
pub trait EdgeInterrupt {
    /// Start delivering pin-change events.
    fn attach(&mut self);
    /// Stop delivering pin-change events.
    fn detach(&mut self);
}

/// The shared bit timer. Ticks are 0.2 µs (an 80 MHz clock divided
/// by 16); one bus bit is 40 ticks nominal.
pub trait BitTimer {
    /// Fire every `ticks` ticks until disarmed.
    fn arm_periodic(&mut self, ticks: u32);
    /// Fire once after `ticks` ticks.
    fn arm_oneshot(&mut self, ticks: u32);
    /// Stop firing.
    fn disarm(&mut self);
}

/// Time sources: the CPU cycle counter for edge intervals, a millisecond
/// counter for frame time stamps. Both may roll over; all arithmetic on
/// them is wrapping.
pub trait Clock {
    /// Current CPU cycle count.
    fn cycles(&mut self) -> u32;
    /// Current millisecond count.
    fn millis(&mut self) -> u32;
}

/// Blocking delay used by the queue-full wait in the submit calls.
pub trait Delay {
    /// Block for `ms` milliseconds.
    fn delay_ms(&mut self, ms: u32);
}

/// Compile-time configuration of a [`VanBus`]: the hardware types behind
/// the seams, the mutex flavour, and the timing parameters.
pub trait BusCfg {
    /// Mutex flavour guarding the shared engine state. On single-core
    /// targets `CriticalSectionRawMutex` is the usual choice.
    type Mutex: RawMutex + 'static;
    /// The transceiver pin pair.
    type Pins: BusPins;
    /// The shared bit timer.
    type Timer: BitTimer;
    /// Pin-change interrupt control.
    type Edge: EdgeInterrupt;
    /// Cycle and millisecond time sources.
    type Clock: Clock;

    /// CPU clock as a multiple of the 80 MHz reference (2 for 160 MHz).
    const CPU_F_FACTOR: u32 = 1;

    /// Timer ticks per transmitted bit. Nominally 40 for 8 µs bits;
    /// adding one tick measurably improves the bit timing on real
    /// hardware, presumably absorbing the interrupt entry latency.
    const BIT_TIMER_TICKS: u32 = 41;
}

/// Error returned by [`VanBus::setup`].
#[derive(Debug, PartialEq, Eq)]
#[non_exhaustive]
pub enum SetupError {
    /// `setup` was called twice; the hardware is already bound.
    AlreadySetup,
}
