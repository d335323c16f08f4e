//! Host-side integration tests driving the whole modem through simulated
//! pins, timer, and clock, including a loopback wire so transmissions can
//! be checked bit for bit.

use std::cell::{Cell, RefCell};
use std::rc::Rc;

use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use walnuss::frame::{stuff_frame, Ack, RxResult};
use walnuss::{
    BitTimer, BusCfg, BusLevel, BusPins, Clock, Delay, EdgeInterrupt, RxFrame, SetupError, VanBus,
};

const BIT: u32 = 667;
const BIT_CYCLES: u32 = 41 * 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TimerMode {
    Off,
    OneShot(u32),
    Periodic(u32),
}

struct WireState {
    level: Cell<BusLevel>,
    forced_dominant: Cell<bool>,
    cycles: Cell<u32>,
    ms: Cell<u32>,
    writes: RefCell<Vec<BusLevel>>,
    timer: Cell<TimerMode>,
    edge_attached: Cell<bool>,
}

impl WireState {
    fn new() -> Rc<Self> {
        Rc::new(Self {
            level: Cell::new(BusLevel::Recessive),
            forced_dominant: Cell::new(false),
            cycles: Cell::new(1_000_000),
            ms: Cell::new(0),
            writes: RefCell::new(Vec::new()),
            timer: Cell::new(TimerMode::Off),
            edge_attached: Cell::new(false),
        })
    }
}

struct SimPins(Rc<WireState>);

impl BusPins for SimPins {
    fn read(&mut self) -> BusLevel {
        if self.0.forced_dominant.get() {
            BusLevel::Dominant
        } else {
            self.0.level.get()
        }
    }

    fn write(&mut self, level: BusLevel) {
        // Loopback: the receiver pin sees what the transmitter drives.
        self.0.level.set(level);
        self.0.writes.borrow_mut().push(level);
    }
}

struct SimTimer(Rc<WireState>);

impl BitTimer for SimTimer {
    fn arm_periodic(&mut self, ticks: u32) {
        self.0.timer.set(TimerMode::Periodic(ticks));
    }

    fn arm_oneshot(&mut self, ticks: u32) {
        self.0.timer.set(TimerMode::OneShot(ticks));
    }

    fn disarm(&mut self) {
        self.0.timer.set(TimerMode::Off);
    }
}

struct SimEdge(Rc<WireState>);

impl EdgeInterrupt for SimEdge {
    fn attach(&mut self) {
        self.0.edge_attached.set(true);
    }

    fn detach(&mut self) {
        self.0.edge_attached.set(false);
    }
}

struct SimClock(Rc<WireState>);

impl Clock for SimClock {
    fn cycles(&mut self) -> u32 {
        self.0.cycles.get()
    }

    fn millis(&mut self) -> u32 {
        self.0.ms.get()
    }
}

struct Cfg;

impl BusCfg for Cfg {
    type Mutex = CriticalSectionRawMutex;
    type Pins = SimPins;
    type Timer = SimTimer;
    type Edge = SimEdge;
    type Clock = SimClock;
}

struct NopDelay;

impl Delay for NopDelay {
    fn delay_ms(&mut self, _ms: u32) {}
}

/// A delay that moonlights as the bit-timer interrupt, so blocking sends
/// can make progress in a single-threaded test.
struct TickDelay<'a, const RXQ: usize, const TXQ: usize> {
    bus: &'a VanBus<Cfg, RXQ, TXQ>,
    st: Rc<WireState>,
}

impl<const RXQ: usize, const TXQ: usize> Delay for TickDelay<'_, RXQ, TXQ> {
    fn delay_ms(&mut self, _ms: u32) {
        self.st.cycles.set(self.st.cycles.get().wrapping_add(BIT_CYCLES));
        self.bus.on_bit_timer();
    }
}

fn setup<const RXQ: usize, const TXQ: usize>() -> (VanBus<Cfg, RXQ, TXQ>, Rc<WireState>) {
    let st = WireState::new();
    let bus = VanBus::uninit();
    bus.setup(
        SimPins(st.clone()),
        SimTimer(st.clone()),
        SimEdge(st.clone()),
        SimClock(st.clone()),
    )
    .unwrap();
    // setup() idles the bus with one recessive write; drop it so the log
    // holds transmitted bits only.
    st.writes.borrow_mut().clear();
    (bus, st)
}

fn feed_edge<const RXQ: usize, const TXQ: usize>(
    bus: &VanBus<Cfg, RXQ, TXQ>,
    st: &WireState,
    level: BusLevel,
    bits_elapsed: u32,
) {
    st.cycles.set(st.cycles.get().wrapping_add(bits_elapsed * BIT));
    st.ms.set(st.cycles.get() / 80_000);
    st.level.set(level);
    bus.on_pin_edge();
}

fn frame_bits(iden: u16, flags: u8, data: &[u8]) -> Vec<bool> {
    let mut bits = Vec::new();
    for &group in stuff_frame(iden, flags, data).iter() {
        for b in (0..10).rev() {
            bits.push(group >> b & 1 == 1);
        }
    }
    bits
}

fn play_bits<const RXQ: usize, const TXQ: usize>(
    bus: &VanBus<Cfg, RXQ, TXQ>,
    st: &WireState,
    bits: &[bool],
) {
    let mut run_level = true;
    let mut run_len: u32 = 5;
    for &b in bits {
        if b == run_level {
            run_len += 1;
        } else {
            let level = if b { BusLevel::Recessive } else { BusLevel::Dominant };
            feed_edge(bus, st, level, run_len);
            run_level = b;
            run_len = 1;
        }
    }
}

fn play_frame<const RXQ: usize, const TXQ: usize>(
    bus: &VanBus<Cfg, RXQ, TXQ>,
    st: &WireState,
    iden: u16,
    flags: u8,
    data: &[u8],
) {
    play_bits(bus, st, &frame_bits(iden, flags, data));
}

fn run_tx_to_completion<const RXQ: usize, const TXQ: usize>(
    bus: &VanBus<Cfg, RXQ, TXQ>,
    st: &WireState,
) {
    for _ in 0..4000 {
        if st.timer.get() == TimerMode::Off {
            return;
        }
        st.cycles.set(st.cycles.get().wrapping_add(BIT_CYCLES));
        bus.on_bit_timer();
    }
    panic!("transmission never finished");
}

fn expected_levels(iden: u16, flags: u8, data: &[u8]) -> Vec<BusLevel> {
    frame_bits(iden, flags, data)
        .iter()
        .map(|&b| if b { BusLevel::Recessive } else { BusLevel::Dominant })
        .collect()
}

#[test]
fn setup_binds_once() {
    let (bus, st) = setup::<15, 5>();
    assert!(bus.is_setup());
    assert!(st.edge_attached.get());
    // The bus idles recessive.
    assert_eq!(st.level.get(), BusLevel::Recessive);

    let st2 = WireState::new();
    assert_eq!(
        bus.setup(
            SimPins(st2.clone()),
            SimTimer(st2.clone()),
            SimEdge(st2.clone()),
            SimClock(st2),
        ),
        Err(SetupError::AlreadySetup)
    );
}

#[test]
fn nothing_works_before_setup() {
    let bus: VanBus<Cfg, 15, 5> = VanBus::uninit();
    assert!(!bus.is_setup());
    assert!(!bus.available());
    assert!(!bus.receive(&mut RxFrame::new(), None));
    assert!(!bus.send_packet(0x8A4, 0x08, &[0x00], 10, &mut NopDelay));
    assert!(!bus.sync_send_packet(0x8A4, 0x08, &[0x00], 10, &mut NopDelay));
}

#[test]
fn receives_a_frame_end_to_end() {
    let (bus, st) = setup::<15, 5>();

    play_frame(&bus, &st, 0x8A4, 0x08, &[0x00]);
    // EOD arms the one-shot ack-wait window (2 bit slots).
    assert_eq!(st.timer.get(), TimerMode::OneShot(80));
    assert!(!bus.available());

    bus.on_bit_timer();
    assert_eq!(st.timer.get(), TimerMode::Off);
    assert!(bus.available());

    let mut pkt = RxFrame::new();
    let mut overrun = true;
    assert!(bus.receive(&mut pkt, Some(&mut overrun)));
    assert!(!overrun);
    assert_eq!(pkt.iden(), 0x8A4);
    assert_eq!(pkt.command_flags(), 0x08);
    assert_eq!(pkt.data(), &[0x00]);
    assert_eq!(pkt.data_len(), 1);
    assert_eq!(pkt.result(), RxResult::Ok);
    assert_eq!(pkt.ack(), Ack::NoAck);
    assert_eq!(pkt.seq_no(), 0);
    assert!(pkt.check_crc());

    assert_eq!(bus.rx_count(), 1);
    assert!(!bus.available());
}

#[test]
fn latches_the_ack_pulse() {
    let (bus, st) = setup::<15, 5>();

    play_frame(&bus, &st, 0x4D2, 0x0C, &[0xDE, 0xAD]);
    // A reader pulls the first ACK slot dominant.
    feed_edge(&bus, &st, BusLevel::Dominant, 1);
    bus.on_bit_timer();

    let mut pkt = RxFrame::new();
    assert!(bus.receive(&mut pkt, None));
    assert_eq!(pkt.ack(), Ack::Ack);
    assert_eq!(pkt.command_flags(), 0x0C);
    assert!(pkt.check_crc());
}

#[test]
fn queue_accounting_and_order() {
    let (bus, st) = setup::<15, 5>();
    assert_eq!(bus.queue_size(), 15);

    for data in [&[0x01][..], &[0x02], &[0x03]] {
        play_frame(&bus, &st, 0x123, 0x08, data);
        bus.on_bit_timer();
    }
    assert_eq!(bus.n_queued(), 3);
    assert_eq!(bus.max_queued(), 3);
    assert_eq!(bus.rx_count(), 3);

    let mut pkt = RxFrame::new();
    for expect in [0x01u8, 0x02, 0x03] {
        assert!(bus.receive(&mut pkt, None));
        assert_eq!(pkt.data(), &[expect]);
    }
    assert_eq!(bus.n_queued(), 0);
    assert_eq!(bus.max_queued(), 3);
}

#[test]
fn overrun_is_reported_and_cleared() {
    let (bus, st) = setup::<3, 2>();

    for data in [&[0x01][..], &[0x02], &[0x03], &[0x04]] {
        play_frame(&bus, &st, 0x123, 0x08, data);
        bus.on_bit_timer();
    }
    assert_eq!(bus.n_queued(), 3);
    assert_eq!(bus.rx_stats().overruns, 1);

    let mut pkt = RxFrame::new();
    let mut overrun = false;
    assert!(bus.receive(&mut pkt, Some(&mut overrun)));
    assert!(overrun);

    // The newest frame overwrote the oldest unread one.
    let mut seqs = vec![pkt.seq_no()];
    while bus.receive(&mut pkt, Some(&mut overrun)) {
        // The sticky flag was cleared by the first receive.
        assert!(!overrun);
        seqs.push(pkt.seq_no());
    }
    assert_eq!(seqs, [1, 2, 3]);

    play_frame(&bus, &st, 0x123, 0x08, &[0x05]);
    bus.on_bit_timer();
    assert!(bus.receive(&mut pkt, Some(&mut overrun)));
    assert!(!overrun);
}

#[test]
fn drop_policy_keeps_essential_frames() {
    let (bus, st) = setup::<15, 5>();
    bus.set_drop_policy(1, Some(|f: &RxFrame| f.iden() == 0x555));

    for _ in 0..4 {
        play_frame(&bus, &st, 0x100, 0x08, &[0xAA]);
        bus.on_bit_timer();
    }
    assert_eq!(bus.n_queued(), 2);
    assert_eq!(bus.rx_stats().dropped, 2);

    play_frame(&bus, &st, 0x555, 0x08, &[0xBB]);
    bus.on_bit_timer();
    assert_eq!(bus.n_queued(), 3);
    // Sequence numbers still count the dropped frames.
    assert_eq!(bus.rx_count(), 5);
}

#[test]
fn transmits_a_frame_bit_exact() {
    let (bus, st) = setup::<15, 5>();

    assert!(bus.send_packet(0x8A4, 0x08, &[0x0F, 0x07], 10, &mut NopDelay));
    assert_eq!(st.timer.get(), TimerMode::Periodic(41));
    assert_eq!(bus.tx_count(), 1);

    run_tx_to_completion(&bus, &st);

    assert_eq!(*st.writes.borrow(), expected_levels(0x8A4, 0x08, &[0x0F, 0x07]));
    // Listening was suspended during, and resumed after, our own frame.
    assert!(st.edge_attached.get());
    assert_eq!(st.timer.get(), TimerMode::Off);
    assert_eq!(bus.tx_stats().single_collisions, 0);
}

#[test]
fn carrier_sense_defers_to_a_busy_bus() {
    let (bus, st) = setup::<15, 5>();

    // A foreign frame has just gone by; its last edge stamps the media
    // access time.
    play_frame(&bus, &st, 0x123, 0x08, &[0x01]);
    bus.on_bit_timer();

    assert!(bus.send_packet(0x456, 0x08, &[0x02], 10, &mut NopDelay));

    // Well inside the 13-bit inter-frame window: no bit goes out.
    st.cycles.set(st.cycles.get().wrapping_add(2 * BIT_CYCLES));
    bus.on_bit_timer();
    assert!(st.writes.borrow().is_empty());
    assert!(st.edge_attached.get());

    // Once the window has passed, transmission starts.
    st.cycles.set(st.cycles.get().wrapping_add(14 * BIT_CYCLES));
    bus.on_bit_timer();
    assert_eq!(st.writes.borrow().len(), 1);
    assert!(!st.edge_attached.get());

    run_tx_to_completion(&bus, &st);
    assert_eq!(*st.writes.borrow(), expected_levels(0x456, 0x08, &[0x02]));
}

#[test]
fn collision_backs_off_and_retries() {
    let (bus, st) = setup::<15, 5>();

    assert!(bus.send_packet(0x8A4, 0x08, &[0x55], 10, &mut NopDelay));

    // Somebody else drives the wire dominant as we start.
    st.forced_dominant.set(true);
    st.cycles.set(st.cycles.get().wrapping_add(BIT_CYCLES));
    bus.on_bit_timer();
    st.forced_dominant.set(false);

    run_tx_to_completion(&bus, &st);

    let stats = bus.tx_stats();
    assert_eq!(stats.single_collisions, 1);
    assert_eq!(stats.multiple_collisions, 0);
    // One bit went out before the back-off, then the whole frame again.
    let expected = expected_levels(0x8A4, 0x08, &[0x55]);
    let writes = st.writes.borrow();
    assert_eq!(writes.len(), 1 + expected.len());
    assert_eq!(&writes[1..], expected.as_slice());
}

#[test]
fn full_tx_queue_times_out() {
    let (bus, _st) = setup::<15, 2>();

    assert!(bus.send_packet(0x100, 0x08, &[0x01], 10, &mut NopDelay));
    assert!(bus.send_packet(0x200, 0x08, &[0x02], 10, &mut NopDelay));
    // Queue full and nobody ticking the timer.
    assert!(!bus.send_packet(0x300, 0x08, &[0x03], 3, &mut NopDelay));

    let stats = bus.tx_stats();
    assert_eq!(stats.count, 2);
    assert_eq!(stats.dropped, 1);
}

#[test]
fn sync_send_waits_for_the_wire() {
    let (bus, st) = setup::<15, 5>();

    let mut delay = TickDelay { bus: &bus, st: st.clone() };
    assert!(bus.sync_send_packet(0x8A4, 0x08, &[0x11], 0, &mut delay));

    assert_eq!(*st.writes.borrow(), expected_levels(0x8A4, 0x08, &[0x11]));
    assert_eq!(st.timer.get(), TimerMode::Off);
    assert_eq!(bus.tx_count(), 1);
}

#[test]
fn disable_stops_reception() {
    let (bus, st) = setup::<15, 5>();

    bus.disable();
    assert!(!bus.is_enabled());
    assert!(!st.edge_attached.get());

    play_frame(&bus, &st, 0x8A4, 0x08, &[0x00]);
    bus.on_bit_timer();
    assert!(!bus.available());

    bus.enable();
    assert!(st.edge_attached.get());
    play_frame(&bus, &st, 0x8A4, 0x08, &[0x00]);
    bus.on_bit_timer();
    assert!(bus.available());
}

#[test]
fn wire_corruption_is_repaired_and_counted() {
    let (bus, st) = setup::<15, 5>();

    // Flip one wire bit inside the data byte (a zero inside the first
    // nibble run), so the decoded byte has a single bit error.
    let mut bits = frame_bits(0x8A4, 0x08, &[0x00]);
    bits[31] = !bits[31];
    play_bits(&bus, &st, &bits);
    bus.on_bit_timer();

    let mut pkt = RxFrame::new();
    assert!(bus.receive(&mut pkt, None));
    assert!(!pkt.check_crc());

    assert!(bus.check_crc_and_repair(&mut pkt, None));
    assert!(pkt.check_crc());
    assert_eq!(pkt.data(), &[0x00]);

    let stats = bus.rx_stats();
    assert_eq!(stats.corrupt, 1);
    assert_eq!(stats.repaired, 1);
    assert_eq!(stats.one_bit_errors, 1);
}

#[test]
fn repair_counting_respects_the_interest_filter() {
    let (bus, st) = setup::<15, 5>();

    let mut bits = frame_bits(0x8A4, 0x08, &[0x00]);
    bits[31] = !bits[31];
    play_bits(&bus, &st, &bits);
    bus.on_bit_timer();

    let mut pkt = RxFrame::new();
    assert!(bus.receive(&mut pkt, None));

    // The repair still happens, but a filtered-out frame is not counted.
    assert!(bus.check_crc_and_repair(&mut pkt, Some(|f: &RxFrame| f.iden() == 0x777)));
    assert!(pkt.check_crc());
    assert_eq!(bus.rx_stats().corrupt, 0);
}

#[test]
fn dump_stats_smoke() {
    let (bus, st) = setup::<15, 5>();

    play_frame(&bus, &st, 0x8A4, 0x08, &[0x00]);
    bus.on_bit_timer();

    let mut out = String::new();
    bus.dump_stats(&mut out, true).unwrap();
    assert!(out.contains("transmitted pkts: 0"), "{out}");
    assert!(out.contains("received pkts: 1, corrupt: 0 (0.000%)"), "{out}");

    let mut short = String::new();
    bus.dump_stats(&mut short, false).unwrap();
    assert!(short.contains("received pkts: 1"), "{short}");
}

#[test]
fn edge_trace_records_recent_events() {
    let (bus, st) = setup::<15, 5>();

    play_frame(&bus, &st, 0x8A4, 0x08, &[0x00]);
    bus.on_bit_timer();

    let mut out = [walnuss::trace::EdgeSample::empty(); walnuss::trace::EDGE_TRACE_DEPTH];
    let n = bus.edge_trace(&mut out);
    assert!(n > 0);
    // Every decoded interval in a clean frame is a plausible bit count.
    for sample in &out[..n] {
        assert!(sample.n_bits <= 10);
    }
}
