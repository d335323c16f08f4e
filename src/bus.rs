//! The modem facade: one object owning both directions, shared between
//! the two interrupt handlers and the application.
//!
//! All state lives behind a blocking mutex over the [`RawMutex`] chosen
//! by the [`BusCfg`], so a `VanBus` can be placed in a `static` and the
//! interrupt handlers just call [`on_pin_edge`](VanBus::on_pin_edge) and
//! [`on_bit_timer`](VanBus::on_bit_timer) on it.

use core::cell::RefCell;
use core::fmt;

use embassy_sync::blocking_mutex::Mutex;

use crate::crc::Repair;
use crate::frame::RxFrame;
use crate::rx::{EdgeOutcome, RxEngine, RxStats};
use crate::trace::EdgeSample;
use crate::tx::{TxEngine, TxStats};
use crate::{BitTimer, BusCfg, BusLevel, BusPins, Clock, Delay, EdgeInterrupt, SetupError};

/// Default number of RX frame slots.
pub const DEFAULT_RX_QUEUE_SIZE: usize = 15;

/// Default number of TX frame slots.
pub const DEFAULT_TX_QUEUE_SIZE: usize = 5;

// ACK wait window: 2 bit slots of 8 µs, in 0.2 µs timer ticks.
const ACK_TIMEOUT_TICKS: u32 = 2 * 8 * 5;

// Blocking submitters poll the queue at this granularity.
const SEND_POLL_MS: u32 = 1;

/// Who the shared bit timer is currently working for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TimerRole {
    Idle,
    /// One-shot ack-wait timeout after EOD.
    AckWait,
    /// Periodic transmit bit clock.
    TxBit,
}

struct Hardware<Cfg: BusCfg> {
    pins: Cfg::Pins,
    timer: Cfg::Timer,
    edge: Cfg::Edge,
    clock: Cfg::Clock,
}

struct Inner<Cfg: BusCfg, const RXQ: usize, const TXQ: usize> {
    hw: Option<Hardware<Cfg>>,
    enabled: bool,
    timer_role: TimerRole,
    rx: RxEngine<RXQ>,
    tx: TxEngine<TXQ>,
}

/// A VAN bus software modem.
///
/// Decodes frames from pin-change timing and transmits frames bit by bit
/// from a periodic timer, with CSMA/CD arbitration. Hardware access goes
/// through the seam traits carried by `Cfg`; the engine itself never
/// blocks in interrupt context.
///
/// ```rust
/// use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
/// use walnuss::{BusCfg, BusLevel, BusPins, BitTimer, Clock, EdgeInterrupt, VanBus};
///
/// struct LoopbackPins(BusLevel);
/// impl BusPins for LoopbackPins {
///     fn read(&mut self) -> BusLevel { self.0 }
///     fn write(&mut self, level: BusLevel) { self.0 = level; }
/// }
///
/// struct NoTimer;
/// impl BitTimer for NoTimer {
///     fn arm_periodic(&mut self, _ticks: u32) {}
///     fn arm_oneshot(&mut self, _ticks: u32) {}
///     fn disarm(&mut self) {}
/// }
///
/// struct NoEdge;
/// impl EdgeInterrupt for NoEdge {
///     fn attach(&mut self) {}
///     fn detach(&mut self) {}
/// }
///
/// struct FixedClock;
/// impl Clock for FixedClock {
///     fn cycles(&mut self) -> u32 { 0 }
///     fn millis(&mut self) -> u32 { 0 }
/// }
///
/// struct Cfg;
/// impl BusCfg for Cfg {
///     type Mutex = CriticalSectionRawMutex;
///     type Pins = LoopbackPins;
///     type Timer = NoTimer;
///     type Edge = NoEdge;
///     type Clock = FixedClock;
/// }
///
/// static VAN: VanBus<Cfg> = VanBus::uninit();
///
/// fn main() {
///     VAN.setup(LoopbackPins(BusLevel::Recessive), NoTimer, NoEdge, FixedClock)
///         .unwrap();
///     assert!(!VAN.available());
/// }
/// ```
///
/// On a real target, the GPIO change interrupt calls `VAN.on_pin_edge()`
/// and the timer interrupt calls `VAN.on_bit_timer()`.
pub struct VanBus<
    Cfg: BusCfg,
    const RXQ: usize = DEFAULT_RX_QUEUE_SIZE,
    const TXQ: usize = DEFAULT_TX_QUEUE_SIZE,
> {
    shared: Mutex<Cfg::Mutex, RefCell<Inner<Cfg, RXQ, TXQ>>>,
}

impl<Cfg: BusCfg, const RXQ: usize, const TXQ: usize> VanBus<Cfg, RXQ, TXQ> {
    /// Create a modem with no hardware bound to it yet, usable for
    /// `static` placement. All operations fail or do nothing until
    /// [`setup`](Self::setup) has been called.
    pub const fn uninit() -> Self {
        Self {
            shared: Mutex::new(RefCell::new(Inner {
                hw: None,
                enabled: false,
                timer_role: TimerRole::Idle,
                rx: RxEngine::new(Cfg::CPU_F_FACTOR),
                tx: TxEngine::new(Cfg::BIT_TIMER_TICKS * 16 * Cfg::CPU_F_FACTOR),
            })),
        }
    }

    /// Bind the hardware: idle the bus, start listening for edges.
    pub fn setup(
        &self,
        pins: Cfg::Pins,
        timer: Cfg::Timer,
        edge: Cfg::Edge,
        clock: Cfg::Clock,
    ) -> Result<(), SetupError> {
        self.shared.lock(|c| {
            let mut inner = c.borrow_mut();
            if inner.hw.is_some() {
                return Err(SetupError::AlreadySetup);
            }

            let mut hw: Hardware<Cfg> = Hardware { pins, timer, edge, clock };
            hw.pins.write(BusLevel::Recessive);
            hw.edge.attach();
            inner.hw = Some(hw);
            inner.enabled = true;

            van_info!("van bus modem ready");
            Ok(())
        })
    }

    /// Whether [`setup`](Self::setup) has completed.
    pub fn is_setup(&self) -> bool {
        self.shared.lock(|c| c.borrow().hw.is_some())
    }

    /// Entry point for the pin-change interrupt.
    pub fn on_pin_edge(&self) {
        self.shared.lock(|c| {
            let mut guard = c.borrow_mut();
            let inner = &mut *guard;
            let Some(hw) = inner.hw.as_mut() else { return };
            if !inner.enabled {
                return;
            }

            let curr = hw.clock.cycles();
            let level = hw.pins.read();
            let now_ms = hw.clock.millis();

            match inner.rx.pin_edge(level, curr, now_ms) {
                EdgeOutcome::Continue => {}
                EdgeOutcome::ArmAckTimer => {
                    hw.timer.arm_oneshot(ACK_TIMEOUT_TICKS);
                    inner.timer_role = TimerRole::AckWait;
                }
                EdgeOutcome::DisarmAckTimer => {
                    hw.timer.disarm();
                    inner.timer_role = TimerRole::Idle;
                }
                EdgeOutcome::FrameDone => {
                    van_trace!("rx frame completed with error result");
                }
            }
        })
    }

    /// Entry point for the bit-timer interrupt, serving whichever role
    /// the timer was last armed for.
    pub fn on_bit_timer(&self) {
        self.shared.lock(|c| {
            let mut guard = c.borrow_mut();
            let inner = &mut *guard;
            let Some(hw) = inner.hw.as_mut() else { return };

            match inner.timer_role {
                TimerRole::Idle => {}
                TimerRole::AckWait => {
                    let now_ms = hw.clock.millis();
                    inner.rx.ack_timeout(now_ms);

                    if inner.tx.pending() {
                        // Hand the timer straight over to the transmitter.
                        hw.timer.arm_periodic(Cfg::BIT_TIMER_TICKS);
                        inner.timer_role = TimerRole::TxBit;
                    } else {
                        hw.timer.disarm();
                        inner.timer_role = TimerRole::Idle;
                    }
                }
                TimerRole::TxBit => {
                    let pin = hw.pins.read();
                    let curr = hw.clock.cycles();
                    let tick = inner.tx.bit_tick(pin, curr, inner.rx.last_media_access_at());

                    if tick.started {
                        // Don't decode the edges of our own transmission.
                        hw.edge.detach();
                    }
                    if let Some(level) = tick.drive {
                        hw.pins.write(level);
                    }
                    if tick.finished {
                        // It was us on the wire just now.
                        inner.rx.set_last_media_access_at(hw.clock.cycles());
                        hw.edge.attach();
                        if !inner.tx.pending() {
                            hw.timer.disarm();
                            inner.timer_role = TimerRole::Idle;
                        }
                    }
                }
            }
        })
    }

    /// Whether a received frame is waiting to be read.
    pub fn available(&self) -> bool {
        self.shared.lock(|c| {
            let inner = c.borrow();
            inner.hw.is_some() && inner.rx.available()
        })
    }

    /// Copy the oldest unread frame into `pkt`. When `overrun` is given,
    /// it receives (and clears) the sticky queue-overrun flag.
    pub fn receive(&self, pkt: &mut RxFrame, overrun: Option<&mut bool>) -> bool {
        self.shared.lock(|c| {
            let mut inner = c.borrow_mut();
            if inner.hw.is_none() {
                return false;
            }
            let got = inner.rx.receive_into(pkt);
            if let Some(flag) = overrun {
                *flag = inner.rx.take_overrun();
            }
            got
        })
    }

    /// Queue a frame for transmission and return. Waits up to
    /// `timeout_ms` for a free slot when the queue is full; 0 waits
    /// forever. Returns false when the frame was not accepted.
    pub fn send_packet(
        &self,
        iden: u16,
        flags: u8,
        data: &[u8],
        timeout_ms: u32,
        delay: &mut impl Delay,
    ) -> bool {
        if !self.is_setup() {
            return false;
        }
        self.enqueue_with_timeout(iden, flags, data, timeout_ms, delay)
            .is_some()
    }

    /// Queue a frame and wait for it to actually go out on the wire,
    /// at most `timeout_ms` milliseconds (0 waits forever). Returns false
    /// when the frame was not accepted or did not complete in time (it
    /// may still be transmitted later in the latter case).
    pub fn sync_send_packet(
        &self,
        iden: u16,
        flags: u8,
        data: &[u8],
        timeout_ms: u32,
        delay: &mut impl Delay,
    ) -> bool {
        if !self.is_setup() {
            return false;
        }
        let Some(slot) = self.enqueue_with_timeout(iden, flags, data, timeout_ms, delay) else {
            return false;
        };

        let mut waited = 0;
        loop {
            if self.shared.lock(|c| c.borrow().tx.slot_done(slot)) {
                return true;
            }
            if timeout_ms != 0 {
                if waited >= timeout_ms {
                    return false;
                }
                waited += SEND_POLL_MS;
            }
            delay.delay_ms(SEND_POLL_MS);
        }
    }

    fn enqueue_with_timeout(
        &self,
        iden: u16,
        flags: u8,
        data: &[u8],
        timeout_ms: u32,
        delay: &mut impl Delay,
    ) -> Option<usize> {
        let mut waited = 0;
        loop {
            let slot = self.shared.lock(|c| {
                let mut guard = c.borrow_mut();
                let inner = &mut *guard;
                let slot = inner.tx.enqueue(iden, flags, data)?;
                if inner.timer_role == TimerRole::Idle {
                    if let Some(hw) = inner.hw.as_mut() {
                        hw.timer.arm_periodic(Cfg::BIT_TIMER_TICKS);
                        inner.timer_role = TimerRole::TxBit;
                    }
                }
                Some(slot)
            });
            if slot.is_some() {
                return slot;
            }

            if timeout_ms != 0 {
                if waited >= timeout_ms {
                    van_debug!("tx queue full, frame dropped");
                    self.shared.lock(|c| c.borrow_mut().tx.note_dropped());
                    return None;
                }
                waited += SEND_POLL_MS;
            }
            delay.delay_ms(SEND_POLL_MS);
        }
    }

    /// Stop the modem: edges are ignored until [`enable`](Self::enable).
    /// Necessary around timer-intensive work (e.g. flash writes) that
    /// would wreck the edge timing anyway.
    pub fn disable(&self) {
        self.shared.lock(|c| {
            let mut guard = c.borrow_mut();
            let inner = &mut *guard;
            if let Some(hw) = inner.hw.as_mut() {
                hw.edge.detach();
                inner.enabled = false;
            }
        })
    }

    /// Resume after [`disable`](Self::disable).
    pub fn enable(&self) {
        self.shared.lock(|c| {
            let mut guard = c.borrow_mut();
            let inner = &mut *guard;
            if let Some(hw) = inner.hw.as_mut() {
                hw.edge.attach();
                inner.enabled = true;
            }
        })
    }

    /// Whether the modem is listening.
    pub fn is_enabled(&self) -> bool {
        self.shared.lock(|c| c.borrow().enabled)
    }

    /// From how many queued-unread frames onward expendable frames are
    /// dropped. `is_essential` frames are always kept.
    pub fn set_drop_policy(
        &self,
        start_dropping_at: usize,
        is_essential: Option<fn(&RxFrame) -> bool>,
    ) {
        self.shared.lock(|c| {
            c.borrow_mut()
                .rx
                .set_drop_policy(start_dropping_at, is_essential)
        })
    }

    /// CRC check with repair on a received frame, keeping the repair
    /// statistics. `want_to_count` limits which frames enter the
    /// statistics (e.g. only frame types the application cares about);
    /// `None` counts everything.
    pub fn check_crc_and_repair(
        &self,
        pkt: &mut RxFrame,
        want_to_count: Option<fn(&RxFrame) -> bool>,
    ) -> bool {
        let counted = want_to_count.map_or(true, |f| f(pkt));
        let outcome = pkt.check_crc_and_repair();
        self.shared
            .lock(|c| c.borrow_mut().rx.record_repair(outcome, counted));
        outcome != Repair::Failed
    }

    /// Frames received so far (including corrupt and dropped ones).
    pub fn rx_count(&self) -> u32 {
        self.shared.lock(|c| c.borrow().rx.count())
    }

    /// Frames accepted for transmission so far.
    pub fn tx_count(&self) -> u32 {
        self.shared.lock(|c| c.borrow().tx.count())
    }

    /// RX queue capacity.
    pub fn queue_size(&self) -> usize {
        RXQ
    }

    /// Frames currently queued unread.
    pub fn n_queued(&self) -> usize {
        self.shared.lock(|c| c.borrow().rx.n_queued())
    }

    /// High-water mark of the queue fill level.
    pub fn max_queued(&self) -> usize {
        self.shared.lock(|c| c.borrow().rx.max_queued())
    }

    /// Snapshot of the receive-path counters.
    pub fn rx_stats(&self) -> RxStats {
        self.shared.lock(|c| c.borrow().rx.stats())
    }

    /// Snapshot of the transmit-path counters.
    pub fn tx_stats(&self) -> TxStats {
        self.shared.lock(|c| c.borrow().tx.stats())
    }

    /// Copy the most recent decoder trace samples into `out`, oldest
    /// first. Returns the number of samples written.
    pub fn edge_trace(&self, out: &mut [EdgeSample]) -> usize {
        self.shared.lock(|c| c.borrow().rx.trace_copy_to(out))
    }

    /// Write both directions' statistics to `w`. The long form breaks
    /// the repair counters down by kind.
    pub fn dump_stats(&self, w: &mut dyn fmt::Write, long_form: bool) -> fmt::Result {
        let (rx, tx) = self
            .shared
            .lock(|c| (c.borrow().rx.stats(), c.borrow().tx.stats()));

        writeln!(
            w,
            "transmitted pkts: {}, single collisions: {}, multiple collisions: {}, dropped: {}",
            tx.count, tx.single_collisions, tx.multiple_collisions, tx.dropped
        )?;

        let overall = rx.corrupt - rx.repaired;
        if long_form {
            write!(w, "received pkts: {}, corrupt: {} (", rx.count, rx.corrupt)?;
            write_percent(w, rx.corrupt, rx.count)?;
            write!(w, "%), repaired: {} (", rx.repaired)?;
            write_ratio(w, rx.repaired, rx.corrupt)?;
            write!(
                w,
                "%) [UB_err: {}, SB_err: {}, DCB_err: {}",
                rx.uncertain_bit_errors, rx.one_bit_errors, rx.two_consecutive_bit_errors
            )?;
            if rx.two_separate_bit_errors > 0 {
                write!(w, ", DSB_err: {}", rx.two_separate_bit_errors)?;
            }
            write!(w, "], overall: {overall} (")?;
            write_percent(w, overall, rx.count)?;
            writeln!(w, "%)")?;
            writeln!(
                w,
                "dropped: {}, overruns: {}, max queued: {}",
                rx.dropped, rx.overruns, rx.max_queued
            )
        } else {
            write!(w, "received pkts: {}, corrupt: {overall} (", rx.count)?;
            write_percent(w, overall, rx.count)?;
            writeln!(w, "%)")
        }
    }
}

fn write_percent(w: &mut dyn fmt::Write, part: u32, whole: u32) -> fmt::Result {
    if whole == 0 {
        return w.write_str("-.---");
    }
    // Three decimals without going through floating point.
    let milli = part as u64 * 100_000 / whole as u64;
    write!(w, "{}.{:03}", milli / 1000, milli % 1000)
}

fn write_ratio(w: &mut dyn fmt::Write, part: u32, whole: u32) -> fmt::Result {
    if whole == 0 {
        return w.write_str("---");
    }
    write!(w, "{}", part as u64 * 100 / whole as u64)
}
