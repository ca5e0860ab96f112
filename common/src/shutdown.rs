use std::collections::BTreeMap;

use chrono::{DateTime, Timelike, Utc};
use serde::{Deserialize, Serialize};

use crate::config::{DeviceSettings, TurnOffMode};

pub const BED: &str = "bed";
pub const HOTEND: &str = "tool0";

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TemperatureReading {
    pub actual: f64,
    #[serde(default)]
    pub target: Option<f64>,
}

pub type Temperatures = BTreeMap<String, TemperatureReading>;

/// Cooldown targets in Celsius; a negative value disables that heater.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CooldownThresholds {
    pub bed: i32,
    pub hotend: i32,
}

impl From<&DeviceSettings> for CooldownThresholds {
    fn from(device: &DeviceSettings) -> Self {
        Self {
            bed: device.cooldown_bed,
            hotend: device.cooldown_hotend,
        }
    }
}

impl CooldownThresholds {
    /// True once every enabled heater reads at or below its threshold.
    ///
    /// A heater without a reading keeps the watcher waiting.
    pub fn satisfied_by(&self, temperatures: &Temperatures) -> bool {
        heater_cooled(self.bed, temperatures.get(BED))
            && heater_cooled(self.hotend, temperatures.get(HOTEND))
    }
}

fn heater_cooled(threshold: i32, reading: Option<&TemperatureReading>) -> bool {
    if threshold < 0 {
        return true;
    }
    reading.is_some_and(|reading| reading.actual <= f64::from(threshold))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopPlan {
    Timer { delay_secs: u64 },
    Cooldown(CooldownThresholds),
}

impl StopPlan {
    pub fn for_device(device: &DeviceSettings, force_postpone: bool) -> Self {
        if force_postpone {
            return Self::Timer {
                delay_secs: device.postpone_delay,
            };
        }
        match device.turn_off_mode {
            TurnOffMode::Time => Self::Timer {
                delay_secs: device.stop_timer,
            },
            TurnOffMode::Cooldown => Self::Cooldown(CooldownThresholds::from(device)),
        }
    }
}

/// Pending shutdowns are pushed back by `delay`, new ones start from now.
///
/// A deadline that is not in the future anymore counts as no deadline.
pub fn next_shutdown_at(existing: Option<i64>, now_epoch: i64, delay_secs: u64) -> i64 {
    let delay = i64::try_from(delay_secs).unwrap_or(i64::MAX);
    existing
        .filter(|at| *at > now_epoch)
        .unwrap_or(now_epoch)
        .saturating_add(delay)
}

/// Current epoch second, rounded up.
pub fn epoch_ceil(now: DateTime<Utc>) -> i64 {
    let secs = now.timestamp();
    if now.nanosecond() > 0 {
        secs + 1
    } else {
        secs
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;
    use pretty_assertions::assert_eq;

    use super::*;

    fn temps(bed: Option<f64>, hotend: Option<f64>) -> Temperatures {
        let mut temperatures = Temperatures::new();
        if let Some(actual) = bed {
            temperatures.insert(BED.to_string(), TemperatureReading { actual, target: None });
        }
        if let Some(actual) = hotend {
            temperatures.insert(
                HOTEND.to_string(),
                TemperatureReading {
                    actual,
                    target: None,
                },
            );
        }
        temperatures
    }

    #[test]
    fn cooldown_needs_every_enabled_heater() {
        let thresholds = CooldownThresholds { bed: 40, hotend: 50 };

        assert!(!thresholds.satisfied_by(&temps(Some(60.0), Some(45.0))));
        assert!(!thresholds.satisfied_by(&temps(Some(35.0), Some(180.0))));
        assert!(thresholds.satisfied_by(&temps(Some(40.0), Some(49.5))));
    }

    #[test]
    fn disabled_heaters_are_ignored() {
        let thresholds = CooldownThresholds { bed: -1, hotend: 50 };
        assert!(thresholds.satisfied_by(&temps(Some(110.0), Some(30.0))));
        assert!(thresholds.satisfied_by(&temps(None, Some(30.0))));
    }

    #[test]
    fn missing_reading_keeps_waiting() {
        let thresholds = CooldownThresholds { bed: -1, hotend: 50 };
        assert!(!thresholds.satisfied_by(&temps(Some(20.0), None)));
    }

    #[test]
    fn postpone_forces_timer_with_postpone_delay() {
        let mut device = DeviceSettings::wizard_outlet("1");
        device.postpone_delay = 120;

        assert_eq!(
            StopPlan::for_device(&device, false),
            StopPlan::Cooldown(CooldownThresholds { bed: -1, hotend: 50 })
        );
        assert_eq!(
            StopPlan::for_device(&device, true),
            StopPlan::Timer { delay_secs: 120 }
        );
    }

    #[test]
    fn pending_shutdown_is_extended() {
        assert_eq!(next_shutdown_at(None, 1_000, 30), 1_030);
        assert_eq!(next_shutdown_at(Some(1_030), 1_010, 30), 1_060);
    }

    #[test]
    fn elapsed_shutdown_is_not_extended() {
        assert_eq!(next_shutdown_at(Some(990), 1_000, 10), 1_010);
        assert_eq!(next_shutdown_at(Some(1_000), 1_000, 10), 1_010);
    }

    #[test]
    fn epoch_rounds_up_partial_seconds() {
        let whole = Utc.timestamp_opt(1_000, 0).unwrap();
        let partial = Utc.timestamp_opt(1_000, 1).unwrap();
        assert_eq!(epoch_ceil(whole), 1_000);
        assert_eq!(epoch_ceil(partial), 1_001);
    }
}
