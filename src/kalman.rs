//! Constant-velocity Kalman filter over a normalized box.
//!
//! State layout is `[cx, cy, w, h, vcx, vcy, vw, vh]`; velocities are in
//! normalized units per second. Only the first four components are observed.

use nalgebra as na;
use tracing::warn;

use crate::detection::BoundingBox;

type Vector8 = na::SVector<f32, 8>;
type Matrix8 = na::SMatrix<f32, 8, 8>;
type Matrix4x8 = na::SMatrix<f32, 4, 8>;

/// Multiplier applied to the reported confidence on every `predict`.
pub const PREDICT_CONFIDENCE_DECAY: f32 = 0.95;
/// Weight of the previous confidence when a new measurement arrives.
pub const UPDATE_CONFIDENCE_MEMORY: f32 = 0.9;

const INITIAL_VELOCITY_VARIANCE: f32 = 1000.0;
const PROCESS_NOISE: f32 = 0.01;
const MEASUREMENT_NOISE: f32 = 0.1;

#[derive(Debug, Clone)]
pub struct MotionState {
    state: Vector8,
    covariance: Matrix8,
    process_noise: Matrix8,
    measurement_noise: na::Matrix4<f32>,
    measurement: Matrix4x8,
    pub confidence: f32,
    pub hits: u32,
    pub hit_streak: u32,
    pub time_since_update: u32,
    pub age: u32,
    pub last_timestamp: f64,
}

impl MotionState {
    pub fn new(bbox: &BoundingBox, timestamp: f64) -> Self {
        let state = Vector8::from_column_slice(&[
            bbox.x,
            bbox.y,
            bbox.width,
            bbox.height,
            0.0,
            0.0,
            0.0,
            0.0,
        ]);

        let mut covariance = Matrix8::identity();
        for i in 4..8 {
            covariance[(i, i)] = INITIAL_VELOCITY_VARIANCE;
        }

        Self {
            state,
            covariance,
            process_noise: Matrix8::identity() * PROCESS_NOISE,
            measurement_noise: na::Matrix4::identity() * MEASUREMENT_NOISE,
            measurement: Matrix4x8::from_fn(|r, c| if r == c { 1.0 } else { 0.0 }),
            confidence: bbox.confidence,
            hits: 1,
            hit_streak: 0,
            time_since_update: 0,
            age: 1,
            last_timestamp: timestamp,
        }
    }

    #[inline]
    fn transition(dt: f32) -> Matrix8 {
        let mut f = Matrix8::identity();
        for i in 0..4 {
            f[(i, i + 4)] = dt;
        }
        f
    }

    /// Moves state and covariance forward to `now` and makes it the filter's stored state.
    fn propagate(&mut self, now: f64) {
        let dt = (now - self.last_timestamp).max(0.0) as f32;
        let f = Self::transition(dt);

        self.state = f * self.state;
        self.covariance = f * self.covariance * f.transpose() + self.process_noise * dt;
        self.last_timestamp = self.last_timestamp.max(now);
    }

    /// Advances the filter to `now`. Every call ages the track by one frame
    /// and decays its confidence.
    pub fn predict(&mut self, now: f64) -> BoundingBox {
        self.propagate(now);

        self.age += 1;
        self.time_since_update += 1;
        self.confidence *= PREDICT_CONFIDENCE_DECAY;

        self.get_state()
    }

    pub fn update(&mut self, bbox: &BoundingBox, now: f64) {
        self.propagate(now);

        let z = na::Vector4::new(bbox.x, bbox.y, bbox.width, bbox.height);
        let h = &self.measurement;

        let innovation = z - h * self.state;
        let innovation_cov = h * self.covariance * h.transpose() + self.measurement_noise;

        match innovation_cov.try_inverse() {
            Some(inv) => {
                let gain = self.covariance * h.transpose() * inv;

                self.state += gain * innovation;
                self.covariance = (Matrix8::identity() - gain * h) * self.covariance;
            }
            None => warn!("singular innovation covariance, skipping correction"),
        }

        self.hits += 1;
        self.hit_streak += 1;
        self.time_since_update = 0;
        self.confidence = f32::max(self.confidence * UPDATE_CONFIDENCE_MEMORY, bbox.confidence);
    }

    /// A frame passed without a matching measurement.
    #[inline]
    pub fn mark_missed(&mut self) {
        self.hit_streak = 0;
    }

    /// Current estimate as a clamped box carrying the stored confidence.
    pub fn get_state(&self) -> BoundingBox {
        BoundingBox::new(
            self.state[0],
            self.state[1],
            self.state[2],
            self.state[3],
            self.confidence,
        )
        .clamped()
    }

    #[inline]
    pub fn velocity(&self) -> (f32, f32) {
        (self.state[4], self.state[5])
    }
}
