use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use serde::Serialize;

use crate::buffers::lock;
use crate::config::TrackingConfig;

/// Tracks arrival of one sensor stream on the sensor clock.
#[derive(Debug)]
pub struct SensorHealth {
    pub name: &'static str,
    pub silence_threshold: f64,
    last_update: Mutex<Option<f64>>,
    samples: AtomicU64,
}

impl SensorHealth {
    pub fn new(name: &'static str, silence_threshold: f64) -> Self {
        SensorHealth {
            name,
            silence_threshold,
            last_update: Mutex::new(None),
            samples: AtomicU64::new(0),
        }
    }

    pub fn update(&self, timestamp: f64) {
        let mut last = lock(&self.last_update);
        if last.map_or(true, |t| timestamp > t) {
            *last = Some(timestamp);
        }
        self.samples.fetch_add(1, Ordering::Relaxed);
    }

    pub fn last_update(&self) -> Option<f64> {
        *lock(&self.last_update)
    }

    pub fn time_since_last_update(&self, now: f64) -> Option<f64> {
        self.last_update().map(|t| (now - t).max(0.0))
    }

    /// A stream that never reported counts as silent.
    pub fn is_silent(&self, now: f64) -> bool {
        self.time_since_last_update(now)
            .map_or(true, |d| d > self.silence_threshold)
    }

    pub fn sample_count(&self) -> u64 {
        self.samples.load(Ordering::Relaxed)
    }

    pub fn reset(&self) {
        *lock(&self.last_update) = None;
        self.samples.store(0, Ordering::Relaxed);
    }

    fn status(&self, now: f64) -> StreamStatus {
        StreamStatus {
            name: self.name,
            healthy: !self.is_silent(now),
            silence_secs: self.time_since_last_update(now),
            samples: self.sample_count(),
        }
    }
}

/// Per-stream silence detection for the three input streams.
#[derive(Debug)]
pub struct HealthMonitor {
    pub accel: SensorHealth,
    pub gyro: SensorHealth,
    pub visual: SensorHealth,
}

impl HealthMonitor {
    pub fn new(config: &TrackingConfig) -> Self {
        // Inertial streams: ten nominal periods. Visual: the correction staleness bound.
        let inertial_silence = 10.0 / config.nominal_sample_rate_hz;
        HealthMonitor {
            accel: SensorHealth::new("Accel", inertial_silence),
            gyro: SensorHealth::new("Gyro", inertial_silence),
            visual: SensorHealth::new("Visual", config.stale_threshold),
        }
    }

    pub fn check_health(&self, now: f64) -> HealthReport {
        HealthReport {
            accel: self.accel.status(now),
            gyro: self.gyro.status(now),
            visual: self.visual.status(now),
        }
    }

    /// Format health status for logging
    pub fn format_status(&self, now: f64) -> String {
        let report = self.check_health(now);
        format!(
            "Health: Accel {} | Gyro {} | Visual {}",
            report.accel.symbol(),
            report.gyro.symbol(),
            report.visual.symbol()
        )
    }

    pub fn reset(&self) {
        self.accel.reset();
        self.gyro.reset();
        self.visual.reset();
    }
}

impl Default for HealthMonitor {
    fn default() -> Self {
        Self::new(&TrackingConfig::default())
    }
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct StreamStatus {
    pub name: &'static str,
    pub healthy: bool,
    pub silence_secs: Option<f64>,
    pub samples: u64,
}

impl StreamStatus {
    fn symbol(&self) -> String {
        match (self.healthy, self.silence_secs) {
            (true, _) => "✓".to_string(),
            (false, Some(secs)) => format!("⚠ (silent {secs:.2}s)"),
            (false, None) => "⚠ (no data)".to_string(),
        }
    }
}

/// Report of sensor health status
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct HealthReport {
    pub accel: StreamStatus,
    pub gyro: StreamStatus,
    pub visual: StreamStatus,
}

impl HealthReport {
    pub fn all_healthy(&self) -> bool {
        self.accel.healthy && self.gyro.healthy && self.visual.healthy
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_silence_on_sensor_clock() {
        let monitor = HealthMonitor::default();
        assert!(monitor.gyro.is_silent(0.0));

        monitor.gyro.update(1.0);
        monitor.gyro.update(1.01);
        assert!(!monitor.gyro.is_silent(1.05));
        assert!(monitor.gyro.is_silent(1.5));
        assert_eq!(monitor.gyro.sample_count(), 2);

        // Late samples never move the clock backwards.
        monitor.gyro.update(0.5);
        assert_eq!(monitor.gyro.last_update(), Some(1.01));
    }

    #[test]
    fn test_report_and_status_line() {
        let monitor = HealthMonitor::default();
        monitor.accel.update(2.0);
        monitor.gyro.update(2.0);
        monitor.visual.update(1.0);

        let report = monitor.check_health(2.01);
        assert!(report.accel.healthy && report.gyro.healthy);
        assert!(!report.visual.healthy);
        assert!(!report.all_healthy());

        let line = monitor.format_status(2.01);
        assert!(line.starts_with("Health: Accel ✓ | Gyro ✓ | Visual ⚠"));

        monitor.reset();
        assert!(monitor.format_status(2.01).contains("no data"));
    }
}
