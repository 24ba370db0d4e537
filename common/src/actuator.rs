/// Steps per fade direction; one full cycle is fade-in plus fade-out.
pub const FADE_STEPS: u32 = 100;
/// 16-bit PWM duty range.
pub const MAX_DUTY: u32 = 65_535;

/// Duty for one fade step, scaling a 0-255 color channel into the 16-bit
/// PWM range.
pub fn duty_for_step(value: u8, step: u32, steps: u32) -> u32 {
    let peak = u32::from(value) * MAX_DUTY / 255;
    peak * step.min(steps) / steps
}

pub fn rgb_css(r: u8, g: u8, b: u8) -> String {
    format!("rgb({r},{g},{b})")
}

/// xorshift32 color source. The colors are cosmetic; seeded from the
/// monotonic clock by the runtimes.
pub struct ColorSource {
    state: u32,
}

impl ColorSource {
    pub fn new(seed: u32) -> Self {
        Self { state: seed | 1 }
    }

    fn next(&mut self) -> u32 {
        let mut x = self.state;
        x ^= x << 13;
        x ^= x >> 17;
        x ^= x << 5;
        self.state = x;
        x
    }

    pub fn next_color(&mut self) -> (u8, u8, u8) {
        let word = self.next();
        (word as u8, (word >> 8) as u8, (word >> 16) as u8)
    }
}

/// Live handle to a running fade loop. `cancel` must quiesce the hardware
/// outputs (zero duty) on every path, whatever cycle point the
/// cancellation lands on.
pub trait FadeHandle {
    fn cancel(self);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ToggleOutcome {
    Started,
    Stopped,
    NoTask,
}

impl ToggleOutcome {
    pub fn message(self) -> &'static str {
        match self {
            Self::Started => "RGB task started",
            Self::Stopped => "RGB task stopped",
            Self::NoTask => "No RGB task running",
        }
    }
}

/// Single exclusive slot for the indicator animation: at most one fade
/// loop lives at a time. Both triggers (the HTTP toggle and the motion
/// gate) go through one mutex-guarded slot, so the ownership check and
/// the start/cancel are a single atomic step even off the cooperative
/// scheduler.
#[derive(Debug)]
pub struct AnimationSlot<H> {
    handle: Option<H>,
    running: bool,
}

impl<H> Default for AnimationSlot<H> {
    fn default() -> Self {
        Self::new()
    }
}

impl<H> AnimationSlot<H> {
    pub fn new() -> Self {
        Self {
            handle: None,
            running: false,
        }
    }

    pub fn is_running(&self) -> bool {
        self.running
    }
}

impl<H: FadeHandle> AnimationSlot<H> {
    /// No-op when an animation is already live.
    pub fn start_with(&mut self, spawn: impl FnOnce() -> H) -> bool {
        if self.running {
            return false;
        }
        self.handle = Some(spawn());
        self.running = true;
        true
    }

    /// Cancels the live animation. Returns whether one was running.
    pub fn stop(&mut self) -> bool {
        match self.handle.take() {
            Some(handle) => {
                handle.cancel();
                self.running = false;
                true
            }
            None => {
                self.running = false;
                false
            }
        }
    }

    pub fn toggle_with(&mut self, spawn: impl FnOnce() -> H) -> ToggleOutcome {
        if self.running {
            match self.handle.take() {
                Some(handle) => {
                    handle.cancel();
                    self.running = false;
                    ToggleOutcome::Stopped
                }
                // Unreachable while the slot owns its handle; kept for the
                // wire contract.
                None => ToggleOutcome::NoTask,
            }
        } else {
            self.handle = Some(spawn());
            self.running = true;
            ToggleOutcome::Started
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::cell::Cell;
    use std::rc::Rc;

    struct TestHandle {
        quiesced: Rc<Cell<bool>>,
    }

    impl TestHandle {
        fn new() -> (Self, Rc<Cell<bool>>) {
            let quiesced = Rc::new(Cell::new(false));
            (
                Self {
                    quiesced: quiesced.clone(),
                },
                quiesced,
            )
        }
    }

    impl FadeHandle for TestHandle {
        fn cancel(self) {
            self.quiesced.set(true);
        }
    }

    #[test]
    fn start_is_a_noop_while_running() {
        let mut slot = AnimationSlot::new();
        let (first, _) = TestHandle::new();

        assert!(slot.start_with(|| first));
        assert!(!slot.start_with(|| panic!("second animation spawned")));
        assert!(slot.is_running());
    }

    #[test]
    fn stop_cancels_and_quiesces() {
        let mut slot = AnimationSlot::new();
        let (handle, quiesced) = TestHandle::new();
        slot.start_with(|| handle);

        assert!(slot.stop());
        assert!(quiesced.get());
        assert!(!slot.is_running());
    }

    #[test]
    fn stop_on_empty_slot_reports_nothing_running() {
        let mut slot: AnimationSlot<TestHandle> = AnimationSlot::new();
        assert!(!slot.stop());
    }

    #[test]
    fn toggle_alternates_started_and_stopped() {
        let mut slot = AnimationSlot::new();

        let (first, first_quiesced) = TestHandle::new();
        assert_eq!(slot.toggle_with(|| first), ToggleOutcome::Started);

        let outcome = slot.toggle_with(|| panic!("spawned during stop"));
        assert_eq!(outcome, ToggleOutcome::Stopped);
        assert!(first_quiesced.get());

        let (second, _) = TestHandle::new();
        assert_eq!(slot.toggle_with(|| second), ToggleOutcome::Started);
    }

    #[test]
    fn interleaved_triggers_never_run_two_animations() {
        // Motion start, HTTP stop, motion start again: one live handle at
        // every point.
        let mut slot = AnimationSlot::new();

        let (motion, motion_quiesced) = TestHandle::new();
        assert!(slot.start_with(|| motion));
        assert!(!slot.start_with(|| panic!("http start while motion fade runs")));

        assert_eq!(
            slot.toggle_with(|| panic!("spawned during stop")),
            ToggleOutcome::Stopped
        );
        assert!(motion_quiesced.get());

        let (http, _) = TestHandle::new();
        assert!(slot.start_with(|| http));
        assert!(slot.is_running());
    }

    #[test]
    fn toggle_messages_match_the_control_contract() {
        assert_eq!(ToggleOutcome::Started.message(), "RGB task started");
        assert_eq!(ToggleOutcome::Stopped.message(), "RGB task stopped");
        assert_eq!(ToggleOutcome::NoTask.message(), "No RGB task running");
    }

    #[test]
    fn duty_scales_with_step_and_peaks_at_full_range() {
        assert_eq!(duty_for_step(255, 0, FADE_STEPS), 0);
        assert_eq!(duty_for_step(255, FADE_STEPS, FADE_STEPS), MAX_DUTY);
        assert_eq!(duty_for_step(0, FADE_STEPS, FADE_STEPS), 0);

        let half = duty_for_step(255, FADE_STEPS / 2, FADE_STEPS);
        assert!(half > MAX_DUTY / 3 && half < 2 * MAX_DUTY / 3);
    }

    #[test]
    fn duty_is_monotonic_over_steps() {
        let mut previous = 0;
        for step in 0..=FADE_STEPS {
            let duty = duty_for_step(180, step, FADE_STEPS);
            assert!(duty >= previous);
            previous = duty;
        }
    }

    #[test]
    fn color_source_varies() {
        let mut source = ColorSource::new(7);
        let first = source.next_color();
        let second = source.next_color();
        assert_ne!(first, second);
    }

    #[test]
    fn css_string_matches_reporting_format() {
        assert_eq!(rgb_css(12, 0, 255), "rgb(12,0,255)");
    }
}
