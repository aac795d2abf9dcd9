//! Synthetic depth sensor used when no camera driver is attached.
//!
//! The platform hovers at a fixed altitude and yaws slowly in place inside a
//! cylindrical room, so every pixel sees the wall at the same range.  A
//! sparse pattern of zero samples stands in for the sensor's invalid
//! returns.

use voxmap_types::{DepthFrame, Intrinsics, Pose};

/// Meters per native depth unit (millimetre `z16`).
const DEPTH_SCALE: f64 = 0.001;
/// Every `HOLE_STRIDE`-th pixel reads zero.
const HOLE_STRIDE: usize = 97;

#[derive(Debug, Clone)]
pub struct SyntheticSensor {
    width: usize,
    height: usize,
    intrinsics: Intrinsics,
    wall_distance: f64,
    yaw_rate: f64,
    altitude: f64,
}

impl SyntheticSensor {
    /// A sensor with a horizontal field of view of roughly 80° at the given
    /// resolution.
    pub fn new(width: usize, height: usize) -> Self {
        let focal = 0.6 * width as f64;
        Self {
            width,
            height,
            intrinsics: Intrinsics::new(
                DEPTH_SCALE,
                (width as f64 - 1.0) / 2.0,
                (height as f64 - 1.0) / 2.0,
                focal,
                focal,
            ),
            wall_distance: 4.0,
            yaw_rate: 0.2,
            altitude: -0.25,
        }
    }

    pub fn wall_distance(&self) -> f64 {
        self.wall_distance
    }

    /// Pose at time `t` (seconds): yaw `yaw_rate * t` about the z axis.
    pub fn pose(&self, t: f64) -> Pose {
        let half = 0.5 * self.yaw_rate * t;
        Pose {
            timestamp: t,
            translation: [0.0, 0.0, self.altitude],
            quaternion: [0.0, 0.0, half.sin(), half.cos()],
            confidence: 3,
        }
    }

    pub fn depth_frame(&self, t: f64) -> DepthFrame {
        let wall = (self.wall_distance / DEPTH_SCALE).round() as u16;
        let samples = (0..self.width * self.height)
            .map(|i| if i % HOLE_STRIDE == 0 { 0 } else { wall })
            .collect();
        DepthFrame::from_u16(t, self.width, self.height, samples, self.intrinsics)
    }

    /// Number of non-zero samples in each frame.
    pub fn valid_samples(&self) -> usize {
        let total = self.width * self.height;
        total - total.div_ceil(HOLE_STRIDE)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use voxmap_perception::BinEdges;
    use voxmap_runtime::{FrameProcessor, PipelineConfig};
    use voxmap_types::{DepthSamples, MapDefinition};

    fn room() -> MapDefinition {
        MapDefinition {
            x_min: -12.0,
            y_min: -12.0,
            z_min: -3.0,
            x_max: 12.0,
            y_max: 12.0,
            z_max: 3.0,
            x_div: 121,
            y_div: 121,
            z_div: 31,
        }
    }

    #[test]
    fn pose_quaternion_stays_unit_length() {
        let sensor = SyntheticSensor::new(64, 48);
        for step in 0..50 {
            let q = sensor.pose(step as f64 * 0.37).quaternion;
            let norm = q.iter().map(|c| c * c).sum::<f64>().sqrt();
            assert!((norm - 1.0).abs() < 1e-12);
        }
    }

    #[test]
    fn pose_starts_unrotated_at_fixed_altitude() {
        let sensor = SyntheticSensor::new(64, 48);
        let pose = sensor.pose(0.0);
        assert_eq!(pose.quaternion, [0.0, 0.0, 0.0, 1.0]);
        assert_eq!(pose.translation, sensor.pose(12.0).translation);
    }

    #[test]
    fn frame_reads_wall_in_millimetres_with_holes() {
        let sensor = SyntheticSensor::new(64, 48);
        let frame = sensor.depth_frame(1.5);
        assert_eq!(frame.timestamp, 1.5);
        let DepthSamples::U16(samples) = &frame.samples else {
            panic!("expected native samples");
        };
        assert_eq!(samples.len(), 64 * 48);
        assert_eq!(samples[0], 0);
        assert_eq!(samples[1], 4000);
        let valid = samples.iter().filter(|&&s| s != 0).count();
        assert_eq!(valid, sensor.valid_samples());
    }

    #[test]
    fn every_valid_sample_lands_inside_the_default_room() {
        let sensor = SyntheticSensor::new(64, 48);
        let config = PipelineConfig {
            width: 64,
            height: 48,
            ..PipelineConfig::default()
        };
        let bins = BinEdges::from_definition(&room()).unwrap();
        let mut processor = FrameProcessor::new(&config, bins).unwrap();

        for t in [0.0, 3.0, 9.5] {
            let batch = processor
                .process(&sensor.depth_frame(t), &sensor.pose(t))
                .unwrap();
            assert_eq!(batch.total_hits(), sensor.valid_samples() as u64);
        }
    }
}
