use embassy_futures::select::{select, Either};
use embassy_time::{Duration, Instant, Timer};
use portable_atomic::{AtomicU32, Ordering};
use spin::Mutex;

use crate::{
    reg::DeviceIo,
    srng::{SrcRing, MAX_RINGS},
    sync::DeadlineSignal,
};

/// What to do with the doorbell for one outbound packet.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum TxDecision {
    /// Skip the doorbell update; the pointer stays queued in the delayed
    /// write layer.
    Coalesce,
    /// Ring the doorbell now.
    Flush,
}
impl TxDecision {
    /// Combine the throughput policy's decision with the latency policy's.
    ///
    /// An explicit flush from either side wins; in particular a
    /// latency-tagged flush always overrides throughput-driven coalescing.
    /// Packets are only coalesced when both policies agree.
    pub fn combine(self, other: TxDecision) -> TxDecision {
        if self == TxDecision::Flush || other == TxDecision::Flush {
            TxDecision::Flush
        } else {
            TxDecision::Coalesce
        }
    }
}

/// Aggregate traffic counters, supplied by the datapath owner. Monotonically
/// increasing; the sampler works on deltas between windows.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct TrafficSnapshot {
    pub tx_bytes: u64,
    pub rx_bytes: u64,
    pub tx_packets: u64,
}

/// SWLM tuning. All thresholds have defaults; none are hardcoded in the
/// policy logic.
#[derive(Clone, Copy, Debug)]
pub struct SwlmConfig {
    pub enabled: bool,
    /// Length of one throughput sampling window.
    pub sampling_interval: Duration,
    /// TX byte delta a window must exceed to qualify.
    pub tx_bytes_thresh: u64,
    /// RX byte delta a window may alternatively exceed to qualify.
    pub rx_bytes_thresh: u64,
    /// Minimum TX packet delta for a window to qualify.
    pub min_tx_pkt_delta: u64,
    /// Consecutive qualifying windows before coalescing starts.
    pub tput_pass_thresh: u32,
    /// A coalescing session ends once this many bytes were coalesced...
    pub max_coalesce_bytes: u32,
    /// ...or once this much time passed, whichever comes first.
    pub max_coalesce_delay: Duration,
    /// Backstop flush timer armed per coalesced packet, so a burst that
    /// stops mid-session cannot defer its doorbell indefinitely.
    pub backstop_delay: Duration,
}
impl Default for SwlmConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            sampling_interval: Duration::from_millis(100),
            tx_bytes_thresh: 2_500_000,
            rx_bytes_thresh: 2_500_000,
            min_tx_pkt_delta: 48,
            tput_pass_thresh: 3,
            max_coalesce_bytes: 90_000,
            max_coalesce_delay: Duration::from_millis(2),
            backstop_delay: Duration::from_millis(1),
        }
    }
}

struct SwlmRingState {
    /// The first check only snapshots the counters; deltas are meaningless
    /// before a full window has elapsed.
    primed: bool,
    prev: TrafficSnapshot,
    window_expiry: Instant,
    tput_pass_cnt: u32,
    coalescing: bool,
    bytes_coalesced: u32,
    coalesce_end_time: Instant,
}
impl SwlmRingState {
    const fn new() -> Self {
        Self {
            primed: false,
            prev: TrafficSnapshot {
                tx_bytes: 0,
                rx_bytes: 0,
                tx_packets: 0,
            },
            window_expiry: Instant::from_ticks(0),
            tput_pass_cnt: 0,
            coalescing: false,
            bytes_coalesced: 0,
            coalesce_end_time: Instant::from_ticks(0),
        }
    }
    fn end_session(&mut self) {
        self.coalescing = false;
        self.bytes_coalesced = 0;
    }
}

struct SwlmStats {
    coalesced: AtomicU32,
    flushed: AtomicU32,
    sessions_ended_bytes: AtomicU32,
    sessions_ended_time: AtomicU32,
    backstop_expiry: AtomicU32,
}

/// SWLM statistics snapshot.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SwlmStatsSnapshot {
    pub coalesced: u32,
    pub flushed: u32,
    pub sessions_ended_bytes: u32,
    pub sessions_ended_time: u32,
    pub backstop_expiry: u32,
}

/// Software latency manager: decides per outbound packet whether its
/// doorbell update may be coalesced, based on rolling throughput sampling.
///
/// The state machine per ring: below the throughput threshold every packet
/// flushes. Once `tput_pass_thresh` consecutive sampling windows qualify,
/// packets may coalesce, in sessions bounded by `max_coalesce_bytes` and
/// `max_coalesce_delay`. Any window that fails the check drops the ring back
/// to flushing.
pub struct Swlm {
    config: SwlmConfig,
    rings: [Mutex<SwlmRingState>; MAX_RINGS],
    backstop: [DeadlineSignal; MAX_RINGS],
    stats: SwlmStats,
}

impl Swlm {
    pub fn new(config: SwlmConfig) -> Self {
        #[allow(clippy::declare_interior_mutable_const)]
        const RING_STATE: Mutex<SwlmRingState> = Mutex::new(SwlmRingState::new());
        #[allow(clippy::declare_interior_mutable_const)]
        const SIGNAL: DeadlineSignal = DeadlineSignal::new();
        Self {
            config,
            rings: [RING_STATE; MAX_RINGS],
            backstop: [SIGNAL; MAX_RINGS],
            stats: SwlmStats {
                coalesced: AtomicU32::new(0),
                flushed: AtomicU32::new(0),
                sessions_ended_bytes: AtomicU32::new(0),
                sessions_ended_time: AtomicU32::new(0),
                backstop_expiry: AtomicU32::new(0),
            },
        }
    }

    pub fn config(&self) -> &SwlmConfig {
        &self.config
    }

    /// Decide the doorbell treatment of one `pkt_len`-byte packet on
    /// `ring_id`, given the current aggregate traffic counters.
    pub fn check(&self, ring_id: u8, pkt_len: u32, traffic: &TrafficSnapshot) -> TxDecision {
        self.check_at(ring_id, pkt_len, traffic, Instant::now())
    }

    /// [check](Self::check) against an explicit clock, the testable core.
    pub fn check_at(
        &self,
        ring_id: u8,
        pkt_len: u32,
        traffic: &TrafficSnapshot,
        now: Instant,
    ) -> TxDecision {
        if !self.config.enabled {
            return TxDecision::Flush;
        }
        let mut ring = self.rings[ring_id as usize].lock();

        if !ring.primed {
            ring.primed = true;
            ring.prev = *traffic;
            ring.window_expiry = now + self.config.sampling_interval;
        } else if now >= ring.window_expiry {
            // Roll the sampling window.
            let tx_delta = traffic.tx_bytes.saturating_sub(ring.prev.tx_bytes);
            let rx_delta = traffic.rx_bytes.saturating_sub(ring.prev.rx_bytes);
            let pkt_delta = traffic.tx_packets.saturating_sub(ring.prev.tx_packets);
            let passed = (tx_delta > self.config.tx_bytes_thresh
                || rx_delta > self.config.rx_bytes_thresh)
                && pkt_delta >= self.config.min_tx_pkt_delta;
            if passed {
                ring.tput_pass_cnt += 1;
            } else {
                ring.tput_pass_cnt = 0;
                ring.end_session();
            }
            ring.prev = *traffic;
            ring.window_expiry = now + self.config.sampling_interval;
        }

        if ring.tput_pass_cnt < self.config.tput_pass_thresh {
            self.stats.flushed.fetch_add(1, Ordering::Relaxed);
            return TxDecision::Flush;
        }

        if !ring.coalescing {
            ring.coalescing = true;
            ring.bytes_coalesced = 0;
            ring.coalesce_end_time = now + self.config.max_coalesce_delay;
        }

        // Session ceilings: whichever is hit first flushes now, and the next
        // qualifying packet starts a fresh session.
        if now >= ring.coalesce_end_time {
            ring.end_session();
            self.stats.sessions_ended_time.fetch_add(1, Ordering::Relaxed);
            self.stats.flushed.fetch_add(1, Ordering::Relaxed);
            return TxDecision::Flush;
        }
        if ring.bytes_coalesced.saturating_add(pkt_len) > self.config.max_coalesce_bytes {
            ring.end_session();
            self.stats.sessions_ended_bytes.fetch_add(1, Ordering::Relaxed);
            self.stats.flushed.fetch_add(1, Ordering::Relaxed);
            return TxDecision::Flush;
        }

        ring.bytes_coalesced += pkt_len;
        self.stats.coalesced.fetch_add(1, Ordering::Relaxed);
        self.backstop[ring_id as usize].arm_or_tighten(now + self.config.backstop_delay);
        TxDecision::Coalesce
    }

    /// The backstop deadline currently armed for `ring_id`, if any.
    pub fn backstop_deadline(&self, ring_id: u8) -> Option<Instant> {
        self.backstop[ring_id as usize].armed_deadline()
    }

    /// Backstop flush task for one ring. Spawn alongside the datapath; when
    /// the per-packet backstop expires, it flushes the ring's pending
    /// doorbell without ever blocking on the ring lock.
    pub async fn run_backstop<B: DeviceIo>(&self, ring: &SrcRing<'_, B>) -> ! {
        let signal = &self.backstop[ring.ring_id() as usize];
        loop {
            let deadline = signal.wait_armed().await;
            match select(Timer::at(deadline), signal.changed(deadline)).await {
                Either::First(()) => {
                    if signal.take_expired(Instant::now()).is_some() {
                        self.stats.backstop_expiry.fetch_add(1, Ordering::Relaxed);
                        // Busy ring: the event bit makes the next access
                        // bracket carry the flush.
                        let _ = ring.try_flush_pending();
                    }
                }
                // Tightened or cancelled; re-evaluate.
                Either::Second(()) => {}
            }
        }
    }

    /// Stop coalescing on `ring_id` and forget its session state. Used at
    /// detach.
    pub fn reset_ring(&self, ring_id: u8) {
        let mut ring = self.rings[ring_id as usize].lock();
        *ring = SwlmRingState::new();
        self.backstop[ring_id as usize].cancel();
    }

    pub fn stats(&self) -> SwlmStatsSnapshot {
        SwlmStatsSnapshot {
            coalesced: self.stats.coalesced.load(Ordering::Relaxed),
            flushed: self.stats.flushed.load(Ordering::Relaxed),
            sessions_ended_bytes: self.stats.sessions_ended_bytes.load(Ordering::Relaxed),
            sessions_ended_time: self.stats.sessions_ended_time.load(Ordering::Relaxed),
            backstop_expiry: self.stats.backstop_expiry.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at(ms: u64) -> Instant {
        Instant::from_ticks(0) + Duration::from_millis(ms)
    }

    fn test_config() -> SwlmConfig {
        SwlmConfig {
            enabled: true,
            sampling_interval: Duration::from_millis(100),
            tx_bytes_thresh: 1000,
            rx_bytes_thresh: 1000,
            min_tx_pkt_delta: 1,
            tput_pass_thresh: 2,
            max_coalesce_bytes: 10_000,
            max_coalesce_delay: Duration::from_millis(20),
            backstop_delay: Duration::from_millis(1),
        }
    }

    fn traffic(tx_bytes: u64, tx_packets: u64) -> TrafficSnapshot {
        TrafficSnapshot {
            tx_bytes,
            rx_bytes: 0,
            tx_packets,
        }
    }

    #[test]
    fn disabled_always_flushes() {
        let swlm = Swlm::new(SwlmConfig {
            enabled: false,
            ..test_config()
        });
        let decision = swlm.check_at(0, 100, &traffic(1_000_000, 1000), at(0));
        assert_eq!(decision, TxDecision::Flush);
    }

    #[test]
    fn consecutive_qualifying_windows_enable_coalescing() {
        let swlm = Swlm::new(test_config());
        // First check only snapshots the counters.
        assert_eq!(
            swlm.check_at(0, 100, &traffic(1500, 10), at(0)),
            TxDecision::Flush
        );
        // Still inside window 1.
        assert_eq!(
            swlm.check_at(0, 100, &traffic(2000, 20), at(50)),
            TxDecision::Flush
        );
        // Window 1 closes with 1500 bytes of delta: one pass, still below
        // the streak threshold.
        assert_eq!(
            swlm.check_at(0, 100, &traffic(3000, 30), at(100)),
            TxDecision::Flush
        );
        // Window 2 closes with another qualifying delta: streak reached,
        // packets may coalesce from here on.
        assert_eq!(
            swlm.check_at(0, 100, &traffic(4500, 40), at(200)),
            TxDecision::Coalesce
        );
    }

    #[test]
    fn failing_window_resets_pass_count() {
        let swlm = Swlm::new(test_config());
        // Prime, then one qualifying window.
        swlm.check_at(0, 100, &traffic(1500, 10), at(0));
        assert_eq!(
            swlm.check_at(0, 100, &traffic(3000, 20), at(100)),
            TxDecision::Flush
        );
        // A window with no traffic delta drops the streak back to zero.
        assert_eq!(
            swlm.check_at(0, 100, &traffic(3000, 20), at(200)),
            TxDecision::Flush
        );
        // Qualifying again only counts as the first pass of a new streak.
        assert_eq!(
            swlm.check_at(0, 100, &traffic(4500, 30), at(300)),
            TxDecision::Flush
        );
    }

    /// An SWLM whose ring 0 entered a fresh coalescing session at `now`.
    fn coalescing_swlm(now: Instant) -> Swlm {
        let swlm = Swlm::new(test_config());
        assert_eq!(
            swlm.check_at(0, 0, &traffic(1500, 10), now - Duration::from_millis(200)),
            TxDecision::Flush
        );
        assert_eq!(
            swlm.check_at(0, 0, &traffic(3000, 20), now - Duration::from_millis(100)),
            TxDecision::Flush
        );
        assert_eq!(
            swlm.check_at(0, 0, &traffic(4500, 30), now),
            TxDecision::Coalesce
        );
        swlm
    }

    #[test]
    fn session_byte_ceiling_flushes_and_restarts() {
        let now = at(1000);
        let swlm = coalescing_swlm(now);

        // Fill the session up to just below the byte ceiling.
        let mut coalesced = 0u32;
        loop {
            match swlm.check_at(0, 4000, &traffic(4500, 30), now) {
                TxDecision::Coalesce => coalesced += 4000,
                TxDecision::Flush => break,
            }
            assert!(coalesced <= 10_000);
        }
        assert_eq!(coalesced, 8000);
        assert_eq!(swlm.stats().sessions_ended_bytes, 1);
        // The next packet opens a fresh session and may coalesce again.
        assert_eq!(
            swlm.check_at(0, 4000, &traffic(4500, 30), now),
            TxDecision::Coalesce
        );
    }

    #[test]
    fn session_time_ceiling_flushes() {
        let now = at(1000);
        let swlm = coalescing_swlm(now);
        assert_eq!(
            swlm.check_at(0, 100, &traffic(4500, 30), now),
            TxDecision::Coalesce
        );
        // 20ms later the session deadline has passed; still inside the same
        // sampling window.
        assert_eq!(
            swlm.check_at(0, 100, &traffic(4500, 30), now + Duration::from_millis(20)),
            TxDecision::Flush
        );
        assert_eq!(swlm.stats().sessions_ended_time, 1);
    }

    #[test]
    fn session_never_exceeds_ceilings() {
        let now = at(1000);
        let swlm = coalescing_swlm(now);
        let config = test_config();

        // Arbitrary arrival pattern; at every point the session accumulator
        // and elapsed time stay within the configured ceilings.
        let mut session_bytes = 0u32;
        let mut session_start = None;
        for step in 0..200u64 {
            let t = now + Duration::from_millis(step);
            match swlm.check_at(0, 999, &traffic(4500, 30), t) {
                TxDecision::Coalesce => {
                    session_bytes += 999;
                    let start = *session_start.get_or_insert(t);
                    assert!(session_bytes <= config.max_coalesce_bytes);
                    assert!(t - start <= config.max_coalesce_delay);
                }
                TxDecision::Flush => {
                    session_bytes = 0;
                    session_start = None;
                }
            }
        }
    }

    #[test]
    fn coalescing_arms_the_backstop() {
        let now = at(1000);
        let swlm = coalescing_swlm(now);
        assert_eq!(
            swlm.check_at(0, 100, &traffic(4500, 30), now),
            TxDecision::Coalesce
        );
        assert_eq!(
            swlm.backstop_deadline(0),
            Some(now + test_config().backstop_delay)
        );
    }

    #[test]
    fn combine_prefers_flush() {
        use TxDecision::*;
        assert_eq!(Coalesce.combine(Coalesce), Coalesce);
        assert_eq!(Coalesce.combine(Flush), Flush);
        assert_eq!(Flush.combine(Coalesce), Flush);
        assert_eq!(Flush.combine(Flush), Flush);
    }
}
