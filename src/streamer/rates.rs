/// Absolute per-tick byte cap applied when a direction is unthrottled.
pub const STREAM_ABS_MAX: usize = 100_000_000;

/// Publication period of the averaged rates, in seconds.
const AVG_PERIOD: f64 = 5.0;

/// Low-pass fraction retained from the previously published rate.
const AVG_FRAC: f64 = 0.8;

/// One direction of rate accounting: a drained-counter token bucket for
/// budgeting plus a low-pass filtered throughput figure for display.
#[derive(Debug)]
pub(super) struct DirRate {
    pub total: u64,
    curr: i64,
    curr_ts: f64,
    avg_count: u64,
    pub max_rate: f64, // kB/s, 0 disables the budget
    pub rate: f64,     // kB/s as last published
}

impl DirRate {
    fn new(now: f64) -> Self {
        Self {
            total: 0,
            curr: 0,
            curr_ts: now,
            avg_count: 0,
            // minimal default, 100 B/s
            max_rate: 0.1,
            rate: 0.0,
        }
    }

    /// Bytes this direction may move right now. The consumed counter drains
    /// at `max_rate` with the elapsed interval clamped, so a long stall
    /// cannot bank an unbounded burst.
    pub fn allowed(&mut self, now: f64, limited: bool) -> usize {
        let max_per_tick = (self.max_rate * 1000.0) as i64;
        if !limited || max_per_tick == 0 {
            self.curr = 0;
            self.curr_ts = now;
            return STREAM_ABS_MAX;
        }

        let dt = (now - self.curr_ts).clamp(0.0, 5.0);
        self.curr -= (dt * max_per_tick as f64) as i64;
        if self.curr < 0 {
            self.curr = 0;
        }
        self.curr_ts = now;

        (max_per_tick - self.curr).max(0) as usize
    }

    /// Records bytes actually moved.
    pub fn consumed(&mut self, n: usize) {
        self.total += n as u64;
        self.curr += n as i64;
        self.avg_count += n as u64;
    }
}

/// Both directions plus the shared publication timer.
#[derive(Debug)]
pub(super) struct RateStat {
    pub read: DirRate,
    pub sent: DirRate,
    avg_last_update: f64,
}

impl RateStat {
    pub fn new(now: f64) -> Self {
        Self {
            read: DirRate::new(now),
            sent: DirRate::new(now),
            avg_last_update: now,
        }
    }

    /// Republishes both averaged rates once per period. Unthrottled links
    /// publish zero so they do not skew whole-application totals.
    pub fn update_averages(&mut self, now: f64, limited: bool) {
        let span = now - self.avg_last_update;
        if span <= AVG_PERIOD {
            return;
        }
        for dir in [&mut self.read, &mut self.sent] {
            let instantaneous = dir.avg_count as f64 / (1000.0 * span);
            dir.rate = if limited {
                AVG_FRAC * dir.rate + (1.0 - AVG_FRAC) * instantaneous
            } else {
                0.0
            };
            dir.avg_count = 0;
        }
        self.avg_last_update = now;
    }
}
