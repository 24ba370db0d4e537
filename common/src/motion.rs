/// What the runtime should do in response to a motion edge: start the
/// indicator fade and notify the hub, or cancel it and notify again.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MotionAction {
    Activate,
    Deactivate,
}

/// Edge detector over the polled PIR level. Level holds emit nothing; a
/// rising edge activates only when no animation is live, and a falling
/// edge deactivates only when one is.
#[derive(Debug, Default)]
pub struct MotionGate {
    motion_seen: bool,
}

impl MotionGate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn observe(&mut self, pir_high: bool, animation_running: bool) -> Option<MotionAction> {
        if pir_high {
            if self.motion_seen {
                return None;
            }
            self.motion_seen = true;
            if animation_running {
                // Another trigger already owns the indicator.
                return None;
            }
            Some(MotionAction::Activate)
        } else {
            if !self.motion_seen {
                return None;
            }
            self.motion_seen = false;
            animation_running.then_some(MotionAction::Deactivate)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn rising_edge_activates_when_idle() {
        let mut gate = MotionGate::new();
        assert_eq!(gate.observe(true, false), Some(MotionAction::Activate));
    }

    #[test]
    fn held_motion_does_not_retrigger() {
        let mut gate = MotionGate::new();
        gate.observe(true, false);

        assert_eq!(gate.observe(true, true), None);
        assert_eq!(gate.observe(true, true), None);
    }

    #[test]
    fn rising_edge_defers_to_a_running_animation() {
        let mut gate = MotionGate::new();
        assert_eq!(gate.observe(true, true), None);
    }

    #[test]
    fn falling_edge_deactivates_a_running_animation() {
        let mut gate = MotionGate::new();
        gate.observe(true, false);

        assert_eq!(gate.observe(false, true), Some(MotionAction::Deactivate));
    }

    #[test]
    fn falling_edge_with_nothing_running_is_silent() {
        let mut gate = MotionGate::new();
        gate.observe(true, true);

        assert_eq!(gate.observe(false, false), None);
    }

    #[test]
    fn quiet_level_emits_nothing() {
        let mut gate = MotionGate::new();
        assert_eq!(gate.observe(false, false), None);
        assert_eq!(gate.observe(false, true), None);
    }

    #[test]
    fn full_motion_cycle() {
        let mut gate = MotionGate::new();

        assert_eq!(gate.observe(true, false), Some(MotionAction::Activate));
        assert_eq!(gate.observe(true, true), None);
        assert_eq!(gate.observe(false, true), Some(MotionAction::Deactivate));
        assert_eq!(gate.observe(true, false), Some(MotionAction::Activate));
    }
}
