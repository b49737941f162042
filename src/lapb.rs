use embassy_futures::select::{select, Either};
use embassy_time::{Duration, Instant, Timer};
use portable_atomic::{AtomicU32, Ordering};

use crate::{reg::DeviceIo, srng::SrcRing, swlm::TxDecision, sync::DeadlineSignal};

/// LAPB tuning.
#[derive(Clone, Copy, Debug)]
pub struct LapbConfig {
    pub enabled: bool,
    /// DSCP codepoint applications use to ask for immediate delivery.
    pub flush_indication_dscp: u8,
    /// What the marker is rewritten to before the frame leaves the host.
    pub default_dscp: u8,
    /// Latency budget assumed for frames that carry no tolerance of their
    /// own.
    pub default_latency_tolerance: Duration,
}
impl Default for LapbConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            flush_indication_dscp: 0x2E,
            default_dscp: 0x00,
            default_latency_tolerance: Duration::from_millis(10),
        }
    }
}

/// Per-frame metadata the coalescing decision is keyed on.
///
/// [Lapb::classify] translates the in-band DSCP marker into the
/// `flush_indication` bit, so by the time [Lapb::handle_frame] runs, how the
/// application asked for low latency is already decoupled from how the ring
/// honors it.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FrameMeta {
    pub dscp: u8,
    pub flush_indication: bool,
    /// How long this frame's doorbell may be deferred. Zero means "use the
    /// configured default".
    pub latency_tolerance: Duration,
}
impl FrameMeta {
    pub fn new(dscp: u8) -> Self {
        Self {
            dscp,
            flush_indication: false,
            latency_tolerance: Duration::from_ticks(0),
        }
    }
    pub fn with_latency_tolerance(mut self, latency_tolerance: Duration) -> Self {
        self.latency_tolerance = latency_tolerance;
        self
    }
}

struct LapbStats {
    frames: AtomicU32,
    coalesced: AtomicU32,
    flush_indications: AtomicU32,
    timer_expiry: AtomicU32,
}

/// LAPB statistics snapshot.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct LapbStatsSnapshot {
    pub frames: u32,
    pub coalesced: u32,
    pub flush_indications: u32,
    pub timer_expiry: u32,
}

/// Latency-aware packet batching: coalesce doorbells under a single shared
/// timer sized to the most latency-sensitive pending frame.
///
/// Frames tagged for immediate delivery cancel the timer and flush; everyone
/// else arms or tightens it by their own latency tolerance. The timer task
/// ([run](Self::run)) flushes through the non-blocking access path only, so
/// expiry never stalls: a busy ring is left a flush event to honor on its
/// next bracket.
pub struct Lapb {
    config: LapbConfig,
    timer: DeadlineSignal,
    stats: LapbStats,
}

impl Lapb {
    pub fn new(config: LapbConfig) -> Self {
        Self {
            config,
            timer: DeadlineSignal::new(),
            stats: LapbStats {
                frames: AtomicU32::new(0),
                coalesced: AtomicU32::new(0),
                flush_indications: AtomicU32::new(0),
                timer_expiry: AtomicU32::new(0),
            },
        }
    }

    pub fn config(&self) -> &LapbConfig {
        &self.config
    }

    /// Translate the in-band flush marker: a frame carrying the configured
    /// DSCP codepoint gets the code rewritten to the default and its
    /// flush-indication bit set.
    pub fn classify(&self, meta: &mut FrameMeta) {
        if !self.config.enabled {
            return;
        }
        if meta.dscp == self.config.flush_indication_dscp {
            meta.dscp = self.config.default_dscp;
            meta.flush_indication = true;
            self.stats.flush_indications.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Decide the doorbell treatment of one outbound frame.
    pub fn handle_frame(&self, meta: &FrameMeta) -> TxDecision {
        self.handle_frame_at(meta, Instant::now())
    }

    /// [handle_frame](Self::handle_frame) against an explicit clock, the
    /// testable core.
    pub fn handle_frame_at(&self, meta: &FrameMeta, now: Instant) -> TxDecision {
        if !self.config.enabled {
            return TxDecision::Flush;
        }
        self.stats.frames.fetch_add(1, Ordering::Relaxed);
        if meta.flush_indication {
            self.timer.cancel();
            return TxDecision::Flush;
        }
        let tolerance = if meta.latency_tolerance == Duration::from_ticks(0) {
            self.config.default_latency_tolerance
        } else {
            meta.latency_tolerance
        };
        self.timer.arm_or_tighten(now + tolerance);
        self.stats.coalesced.fetch_add(1, Ordering::Relaxed);
        TxDecision::Coalesce
    }

    /// The deadline of the shared flush timer, if armed.
    pub fn armed_deadline(&self) -> Option<Instant> {
        self.timer.armed_deadline()
    }

    /// Shared flush timer task for the ring this LAPB instance feeds. Spawn
    /// alongside the datapath.
    pub async fn run<B: DeviceIo>(&self, ring: &SrcRing<'_, B>) -> ! {
        loop {
            let deadline = self.timer.wait_armed().await;
            match select(Timer::at(deadline), self.timer.changed(deadline)).await {
                Either::First(()) => {
                    if self.timer.take_expired(Instant::now()).is_some() {
                        self.stats.timer_expiry.fetch_add(1, Ordering::Relaxed);
                        self.expire(ring);
                    }
                }
                // Tightened or cancelled; re-evaluate.
                Either::Second(()) => {}
            }
        }
    }

    /// Timer-expiry flush. Runs in timer context, so it must not block: a
    /// busy ring lock or a transient wake failure just leaves the flush
    /// event set for the next legitimate access.
    pub fn expire<B: DeviceIo>(&self, ring: &SrcRing<'_, B>) {
        let _ = ring.try_flush_pending();
    }

    pub fn stats(&self) -> LapbStatsSnapshot {
        LapbStatsSnapshot {
            frames: self.stats.frames.load(Ordering::Relaxed),
            coalesced: self.stats.coalesced.load(Ordering::Relaxed),
            flush_indications: self.stats.flush_indications.load(Ordering::Relaxed),
            timer_expiry: self.stats.timer_expiry.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at(ms: u64) -> Instant {
        Instant::from_ticks(0) + Duration::from_millis(ms)
    }

    #[test]
    fn timer_tightens_to_most_sensitive_frame() {
        let lapb = Lapb::new(LapbConfig::default());
        let now = at(100);

        let relaxed = FrameMeta::new(0).with_latency_tolerance(Duration::from_millis(50));
        assert_eq!(lapb.handle_frame_at(&relaxed, now), TxDecision::Coalesce);
        assert_eq!(
            lapb.armed_deadline(),
            Some(now + Duration::from_millis(50))
        );

        // A 10ms-tolerance frame with no intervening flush tightens the
        // shared timer to 10ms.
        let urgent = FrameMeta::new(0).with_latency_tolerance(Duration::from_millis(10));
        assert_eq!(lapb.handle_frame_at(&urgent, now), TxDecision::Coalesce);
        assert_eq!(
            lapb.armed_deadline(),
            Some(now + Duration::from_millis(10))
        );

        // A later, more relaxed frame leaves the timer alone.
        assert_eq!(lapb.handle_frame_at(&relaxed, now), TxDecision::Coalesce);
        assert_eq!(
            lapb.armed_deadline(),
            Some(now + Duration::from_millis(10))
        );
    }

    #[test]
    fn flush_indication_cancels_timer() {
        let lapb = Lapb::new(LapbConfig::default());
        let now = at(100);
        let tagged = FrameMeta::new(0).with_latency_tolerance(Duration::from_millis(50));
        lapb.handle_frame_at(&tagged, now);
        assert!(lapb.armed_deadline().is_some());

        let mut flush = FrameMeta::new(LapbConfig::default().flush_indication_dscp);
        lapb.classify(&mut flush);
        assert_eq!(lapb.handle_frame_at(&flush, now), TxDecision::Flush);
        assert_eq!(lapb.armed_deadline(), None);
    }

    #[test]
    fn classify_rewrites_the_marker() {
        let config = LapbConfig {
            flush_indication_dscp: 0x2E,
            default_dscp: 0x0A,
            ..Default::default()
        };
        let lapb = Lapb::new(config);

        let mut meta = FrameMeta::new(0x2E);
        lapb.classify(&mut meta);
        assert!(meta.flush_indication);
        assert_eq!(meta.dscp, 0x0A);
        assert_eq!(lapb.stats().flush_indications, 1);

        // Other codepoints pass through untouched.
        let mut meta = FrameMeta::new(0x12);
        lapb.classify(&mut meta);
        assert!(!meta.flush_indication);
        assert_eq!(meta.dscp, 0x12);
    }

    #[test]
    fn zero_tolerance_uses_the_default() {
        let config = LapbConfig {
            default_latency_tolerance: Duration::from_millis(7),
            ..Default::default()
        };
        let lapb = Lapb::new(config);
        let now = at(0);
        lapb.handle_frame_at(&FrameMeta::new(0), now);
        assert_eq!(lapb.armed_deadline(), Some(now + Duration::from_millis(7)));
    }

    #[test]
    fn disabled_lapb_is_a_bypass() {
        let lapb = Lapb::new(LapbConfig {
            enabled: false,
            ..Default::default()
        });
        let meta = FrameMeta::new(0).with_latency_tolerance(Duration::from_millis(50));
        assert_eq!(lapb.handle_frame_at(&meta, at(0)), TxDecision::Flush);
        assert_eq!(lapb.armed_deadline(), None);
    }
}
