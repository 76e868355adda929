/// Cancelable periodic deadline with drift correction.
///
/// Each expiry re-arms relative to the previous start-of-frame (`sof + period`), never relative to
/// the time the expiry was observed, so late polling does not accumulate skew.
#[derive(Debug, Clone)]
pub struct FrameTimer {
    period_ns: u64,
    sof_ns: u64,
    deadline_ns: Option<u64>,
}

impl FrameTimer {
    pub fn new(period_ns: u64) -> Self {
        assert!(period_ns > 0, "frame period must be non-zero");
        Self {
            period_ns,
            sof_ns: 0,
            deadline_ns: None,
        }
    }

    pub fn period_ns(&self) -> u64 {
        self.period_ns
    }

    /// Timestamp of the most recent start-of-frame.
    pub fn sof_ns(&self) -> u64 {
        self.sof_ns
    }

    pub fn deadline_ns(&self) -> Option<u64> {
        self.deadline_ns
    }

    pub fn is_armed(&self) -> bool {
        self.deadline_ns.is_some()
    }

    /// Starts a new frame at `now_ns` and arms the end-of-frame deadline.
    pub fn start(&mut self, now_ns: u64) {
        self.sof_ns = now_ns;
        self.deadline_ns = Some(now_ns.saturating_add(self.period_ns));
    }

    pub fn cancel(&mut self) {
        self.deadline_ns = None;
    }

    pub fn is_due(&self, now_ns: u64) -> bool {
        self.deadline_ns.is_some_and(|deadline| now_ns >= deadline)
    }

    /// Number of whole frame boundaries that have elapsed by `now_ns`.
    pub fn pending_frames(&self, now_ns: u64) -> u64 {
        match self.deadline_ns {
            Some(deadline) if now_ns >= deadline => 1 + (now_ns - deadline) / self.period_ns,
            _ => 0,
        }
    }

    /// Moves to the next frame: the old deadline becomes the new start-of-frame.
    ///
    /// Has no effect when the timer is not armed.
    pub fn advance(&mut self) {
        if self.deadline_ns.is_none() {
            return;
        }
        self.sof_ns = self.sof_ns.saturating_add(self.period_ns);
        self.deadline_ns = Some(self.sof_ns.saturating_add(self.period_ns));
    }

    /// Drops any backlog and restarts the frame at `now_ns`.
    pub fn resync(&mut self, now_ns: u64) {
        if self.deadline_ns.is_some() {
            self.start(now_ns);
        }
    }
}
