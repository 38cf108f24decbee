//! Frame timing for the streaming loop

use std::collections::VecDeque;
use std::time::{Duration, Instant};

/// Frames kept for the rolling statistics
const HISTORY_LEN: usize = 120;

/// Measures frame times and how often a frame exceeded its budget
pub struct FrameTimer {
    last_frame: Instant,
    delta: Duration,
    frame_count: u64,
    budget: Duration,
    over_budget: u64,
    history: VecDeque<Duration>,
}

impl FrameTimer {
    /// Timer targeting 60 frames per second
    pub fn new() -> Self {
        Self::with_budget(Duration::from_micros(16_667))
    }

    pub fn with_budget(budget: Duration) -> Self {
        Self {
            last_frame: Instant::now(),
            delta: Duration::ZERO,
            frame_count: 0,
            budget,
            over_budget: 0,
            history: VecDeque::with_capacity(HISTORY_LEN),
        }
    }

    /// Call once per frame
    pub fn tick(&mut self) {
        let now = Instant::now();
        self.record(now - self.last_frame);
        self.last_frame = now;
    }

    fn record(&mut self, delta: Duration) {
        self.delta = delta;
        self.frame_count += 1;
        if delta > self.budget {
            self.over_budget += 1;
        }
        if self.history.len() == HISTORY_LEN {
            self.history.pop_front();
        }
        self.history.push_back(delta);
    }

    pub fn delta_secs(&self) -> f32 {
        self.delta.as_secs_f32()
    }

    pub fn frame_count(&self) -> u64 {
        self.frame_count
    }

    /// Frames since creation that took longer than the budget
    pub fn over_budget(&self) -> u64 {
        self.over_budget
    }

    /// Average frames per second over recent history
    pub fn fps(&self) -> f32 {
        let total: Duration = self.history.iter().sum();
        if total.is_zero() {
            return 0.0;
        }
        self.history.len() as f32 / total.as_secs_f32()
    }

    /// Longest recent frame in milliseconds
    pub fn worst_frame_ms(&self) -> f32 {
        self.history
            .iter()
            .max()
            .map_or(0.0, |d| d.as_secs_f32() * 1000.0)
    }
}

impl Default for FrameTimer {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_timer() {
        let timer = FrameTimer::default();
        assert_eq!(timer.frame_count(), 0);
        assert_eq!(timer.fps(), 0.0);
        assert_eq!(timer.worst_frame_ms(), 0.0);
    }

    #[test]
    fn test_rolling_stats() {
        let mut timer = FrameTimer::with_budget(Duration::from_millis(20));
        timer.record(Duration::from_millis(10));
        timer.record(Duration::from_millis(30));

        assert_eq!(timer.frame_count(), 2);
        assert_eq!(timer.over_budget(), 1);
        assert!((timer.fps() - 50.0).abs() < 0.01);
        assert!((timer.worst_frame_ms() - 30.0).abs() < 0.01);
    }

    #[test]
    fn test_history_is_bounded() {
        let mut timer = FrameTimer::new();
        timer.record(Duration::from_millis(100));
        for _ in 0..HISTORY_LEN {
            timer.record(Duration::from_millis(1));
        }
        assert!((timer.worst_frame_ms() - 1.0).abs() < 0.01);
        assert_eq!(timer.over_budget(), 1);
    }
}
