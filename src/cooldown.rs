use std::time::Duration;

/// Two-state polling cadence: normal, or stretched out after a rate limit
/// (or an auth failure) until a fetch succeeds again.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CooldownState {
    engaged: bool,
    normal_interval: Duration,
    resume_interval: Duration,
}

impl CooldownState {
    pub fn new(normal_interval: Duration, resume_interval: Duration) -> Self {
        Self {
            engaged: false,
            normal_interval,
            resume_interval,
        }
    }

    pub fn is_engaged(&self) -> bool {
        self.engaged
    }

    /// Returns `true` when this call caused the transition.
    pub fn engage(&mut self) -> bool {
        !std::mem::replace(&mut self.engaged, true)
    }

    /// Returns `true` when this call caused the transition.
    pub fn disengage(&mut self) -> bool {
        std::mem::replace(&mut self.engaged, false)
    }

    pub fn active_interval(&self) -> Duration {
        if self.engaged {
            self.resume_interval
        } else {
            self.normal_interval
        }
    }

    pub fn normal_interval(&self) -> Duration {
        self.normal_interval
    }

    pub fn resume_interval(&self) -> Duration {
        self.resume_interval
    }

    pub fn set_normal_interval(&mut self, interval: Duration) {
        self.normal_interval = interval;
    }

    pub fn set_resume_interval(&mut self, interval: Duration) {
        self.resume_interval = interval;
    }
}
