//! Frame timing for the render loop

/// Per-frame hook for an external animation engine
///
/// Ticked at the start of every frame while the scene is playing, before
/// any behavior `tick`.
pub trait AnimationDriver {
    /// Advance animations; `time` and `delta` are in milliseconds
    fn update(&mut self, time: f64, delta: f64);
}

/// Tracks scene time across frames
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct FrameClock {
    last_frame: Option<f64>,
    time: f64,
    delta: f64,
    frame: u64,
}

impl FrameClock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a frame at host time `now_ms`; returns `(time, delta)`
    ///
    /// The first frame has a zero delta. Host clocks that step backwards
    /// also yield zero rather than a negative delta.
    pub fn advance(&mut self, now_ms: f64) -> (f64, f64) {
        let delta = match self.last_frame {
            Some(last) => (now_ms - last).max(0.0),
            None => 0.0,
        };
        self.last_frame = Some(now_ms);
        self.time = now_ms;
        self.delta = delta;
        self.frame += 1;
        (self.time, self.delta)
    }

    /// Time of the most recent frame
    pub fn time(&self) -> f64 {
        self.time
    }

    /// Delta of the most recent frame
    pub fn delta(&self) -> f64 {
        self.delta
    }

    /// Number of frames rendered
    pub fn frame(&self) -> u64 {
        self.frame
    }

    /// Whether any frame has been rendered yet
    pub fn has_started(&self) -> bool {
        self.last_frame.is_some()
    }
}
