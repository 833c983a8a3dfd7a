//! Hyperparameters that decay with the training step.
use crate::settings::ScheduleType;

/// A value following a [`ScheduleType`] between an initial value and a floor.
#[derive(Debug, Clone, PartialEq)]
pub struct DecayedValue {
    schedule: ScheduleType,
    initial_value: f32,
    min_value: f32,
    max_step: u64,
}

impl DecayedValue {
    pub fn new(schedule: ScheduleType, initial_value: f32, min_value: f32, max_step: u64) -> Self {
        Self {
            schedule,
            initial_value,
            min_value,
            max_step,
        }
    }

    /// The value at `step`.
    ///
    /// Linear schedules reach `min_value` at `max_step` and stay there.
    pub fn get_value(&self, step: u64) -> f32 {
        match self.schedule {
            ScheduleType::Constant => self.initial_value,
            ScheduleType::Linear => {
                if self.max_step == 0 {
                    return self.min_value;
                }
                let progress = step.min(self.max_step) as f64 / self.max_step as f64;
                let range = (self.initial_value - self.min_value) as f64;
                (range * (1.0 - progress) + self.min_value as f64) as f32
            }
        }
    }
}
