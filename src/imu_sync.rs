//! Pairs the asynchronous accelerometer stream with the gyro stream.
//!
//! The gyro stream is the integration clock: every gyro sample becomes one
//! [`ImuSample`] carrying the accelerometer value linearly interpolated at the
//! gyro timestamp.

use crate::types::{AccelerometerSample, Conditioned, GyroSample, ImuSample, Vec3};

/// Longest distance to the nearest accelerometer sample before the value is
/// reported as missing instead of held [s].
const MAX_ACCEL_HOLD: f64 = 0.05;

/// Accelerometer samples in ascending order, queried by time.
struct AccelTrack<'a> {
    samples: Vec<&'a AccelerometerSample>,
}

impl<'a> AccelTrack<'a> {
    fn new(anchor: Option<&'a AccelerometerSample>, rest: &'a [AccelerometerSample]) -> Self {
        Self {
            samples: anchor.into_iter().chain(rest.iter()).collect(),
        }
    }

    fn at(&self, t: f64) -> Option<Vec3> {
        let first = self.samples.first()?;
        let last = self.samples.last()?;
        if t <= first.timestamp {
            return (first.timestamp - t <= MAX_ACCEL_HOLD).then_some(first.acceleration);
        }
        if t >= last.timestamp {
            return (t - last.timestamp <= MAX_ACCEL_HOLD).then_some(last.acceleration);
        }

        let idx = self.samples.partition_point(|s| s.timestamp <= t);
        let (a, b) = (self.samples[idx - 1], self.samples[idx]);
        let span = b.timestamp - a.timestamp;
        if span <= f64::EPSILON {
            return Some(b.acceleration);
        }
        let u = (t - a.timestamp) / span;
        Some(a.acceleration.lerp(&b.acceleration, u))
    }
}

fn pair_one(gyro: &Conditioned<GyroSample>, track: &AccelTrack) -> ImuSample {
    ImuSample {
        timestamp: gyro.sample.timestamp,
        angular_rate: gyro.sample.angular_rate,
        acceleration: track.at(gyro.sample.timestamp),
        stationary: gyro.stationary,
    }
}

/// Merge gyro and accelerometer windows taken from the buffers.
///
/// Anchors are the newest samples at or before the window start; they are
/// paired too so the caller can bracket its first integration step.
pub fn pair_streams(
    gyro_anchor: Option<&Conditioned<GyroSample>>,
    gyro: &[Conditioned<GyroSample>],
    accel_anchor: Option<&AccelerometerSample>,
    accel: &[AccelerometerSample],
) -> (Option<ImuSample>, Vec<ImuSample>) {
    let track = AccelTrack::new(accel_anchor, accel);
    let anchor = gyro_anchor.map(|g| pair_one(g, &track));
    let merged = gyro.iter().map(|g| pair_one(g, &track)).collect();
    (anchor, merged)
}
