use chrono::{DateTime, Utc};

use crate::config::Zone;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MaintenanceWindow {
    pub open: bool,
    pub just_closed: bool,
}

/// Daily restart window: the configured hour of day, in the configured zone.
#[derive(Debug, Clone, Copy)]
pub struct MaintenanceScheduler {
    hour: u32,
    zone: Zone,
}

impl MaintenanceScheduler {
    pub fn new(hour: u32, zone: Zone) -> Self {
        Self {
            hour: hour % 24,
            zone,
        }
    }

    pub fn hour(&self) -> u32 {
        self.hour
    }

    pub fn window_at(&self, now: DateTime<Utc>) -> MaintenanceWindow {
        let current = self.zone.hour_of(now);
        MaintenanceWindow {
            open: current == self.hour,
            just_closed: current == (self.hour + 1) % 24,
        }
    }

    /// `HH:00`, as shown in status messages.
    pub fn display_time(&self) -> String {
        format!("{:02}:00", self.hour)
    }
}
