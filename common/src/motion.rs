use crate::config::MotionConfig;
use crate::types::FusionLogic;

/// Combines one or two sensor readings into a single detection signal.
pub fn fuse(config: &MotionConfig, primary_active: bool, secondary_active: bool) -> bool {
    if !config.dual_sensor() {
        return primary_active;
    }

    match config.fusion_logic {
        FusionLogic::And => primary_active && secondary_active,
        FusionLogic::Or => primary_active || secondary_active,
        FusionLogic::Weighted => {
            let mut confidence = 0_u16;
            if primary_active {
                confidence += u16::from(config.primary_weight);
            }
            if secondary_active {
                confidence += u16::from(config.secondary_weight);
            }
            confidence >= u16::from(config.detection_threshold)
        }
    }
}

/// What the fused signal did this tick.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MotionTick {
    /// Inactive-to-active transition of the fused signal.
    pub onset: bool,
    /// Active-to-inactive transition of the fused signal.
    pub ceased: bool,
    /// Auto-off delay elapsed since the last observed motion.
    pub auto_off_due: bool,
}

/// Transient motion state. Detection edges and the auto-off timer live
/// here; which switches they touch is decided by the switch bank.
#[derive(Debug, Clone, Default)]
pub struct MotionRuntime {
    detected: bool,
    last_motion_ms: Option<u64>,
    motion_start_ms: Option<u64>,
    auto_off_armed: bool,
}

impl MotionRuntime {
    pub fn detected(&self) -> bool {
        self.detected
    }

    pub fn last_motion_ms(&self) -> Option<u64> {
        self.last_motion_ms
    }

    pub fn motion_start_ms(&self) -> Option<u64> {
        self.motion_start_ms
    }

    pub fn evaluate(
        &mut self,
        config: &MotionConfig,
        primary_active: bool,
        secondary_active: bool,
        now_ms: u64,
    ) -> MotionTick {
        let mut tick = MotionTick::default();
        if !config.enabled {
            return tick;
        }

        let fused = fuse(config, primary_active, secondary_active);

        if fused {
            if !self.detected {
                self.detected = true;
                self.motion_start_ms = Some(now_ms);
                self.auto_off_armed = true;
                tick.onset = true;
            }
            self.last_motion_ms = Some(now_ms);
        } else if self.detected {
            self.detected = false;
            tick.ceased = true;
        }

        if !self.detected && self.auto_off_armed {
            if let Some(last) = self.last_motion_ms {
                let delay_ms = u64::from(config.auto_off_delay_secs) * 1_000;
                if now_ms.saturating_sub(last) > delay_ms {
                    self.auto_off_armed = false;
                    tick.auto_off_due = true;
                }
            }
        }

        tick
    }
}
