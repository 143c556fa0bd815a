// =============================================================================
// Learning-rate schedules
// =============================================================================

/// Cosine annealing from the initial rate down to 10% of it.
///
/// The returned closure follows progress-remaining semantics: an argument of
/// 1.0 means training just started (full rate), 0.0 means finished (10% of
/// the initial rate).
pub fn cosine_lr_schedule(initial_lr: f64) -> impl Fn(f64) -> f64 {
    move |progress_remaining: f64| {
        let p = progress_remaining.clamp(0.0, 1.0);
        initial_lr * (0.1 + 0.9 * 0.5 * (1.0 + (std::f64::consts::PI * (1.0 - p)).cos()))
    }
}

// =============================================================================
// Unit Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn schedule_at_start_is_initial_lr() {
        let schedule = cosine_lr_schedule(0.0003);
        assert!((schedule(1.0) - 0.0003).abs() < 1e-8);
    }

    #[test]
    fn schedule_at_end_is_ten_percent() {
        let schedule = cosine_lr_schedule(0.0003);
        assert!((schedule(0.0) - 0.00003).abs() < 1e-8);
    }

    #[test]
    fn schedule_monotonically_non_increasing() {
        let schedule = cosine_lr_schedule(0.001);
        let mut prev = f64::MAX;
        for i in 0..20 {
            let p = 1.0 - i as f64 / 19.0;
            let lr = schedule(p);
            assert!(lr <= prev + 1e-10, "lr increased at p={p}");
            prev = lr;
        }
    }

    #[test]
    fn schedule_midpoint_near_55_percent() {
        let schedule = cosine_lr_schedule(0.001);
        let lr = schedule(0.5);
        assert!(lr > 0.0004 && lr < 0.0007);
    }

    #[test]
    fn out_of_range_progress_is_clamped() {
        let schedule = cosine_lr_schedule(0.001);
        assert!((schedule(1.5) - 0.001).abs() < 1e-9);
        assert!((schedule(-0.5) - 0.0001).abs() < 1e-9);
    }
}
