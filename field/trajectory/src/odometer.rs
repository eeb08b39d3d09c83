use field_types::SmoothedPosition;

const EARTH_RADIUS_M: f64 = 6_371_000.0;

/// Great-circle distance between two points given in degrees.
pub fn haversine_distance_m(lat1: f64, lon1: f64, lat2: f64, lon2: f64) -> f64 {
    let dlat = (lat2 - lat1).to_radians();
    let dlon = (lon2 - lon1).to_radians();
    let a = (dlat / 2.0).sin().powi(2)
        + lat1.to_radians().cos() * lat2.to_radians().cos() * (dlon / 2.0).sin().powi(2);
    let c = 2.0 * a.sqrt().atan2((1.0 - a).sqrt());
    EARTH_RADIUS_M * c
}

/// Trip odometer over smoothed positions.
///
/// The value never decreases between calls to [DistanceAccumulator::reset].
#[derive(Debug, Clone, Default)]
pub struct DistanceAccumulator {
    total_m: f64,
    last: Option<(f64, f64)>,
}

impl DistanceAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add the step from the previous position to `pos`. Returns the step
    /// length in meters.
    pub fn add(&mut self, pos: &SmoothedPosition) -> f64 {
        let step = match self.last {
            Some((lat, lon)) => haversine_distance_m(lat, lon, pos.lat, pos.lon),
            None => 0.0,
        };
        self.last = Some((pos.lat, pos.lon));
        if step.is_finite() && step > 0.0 {
            self.total_m += step;
            step
        } else {
            0.0
        }
    }

    /// Odometer reading in meters.
    pub fn value(&self) -> f64 {
        self.total_m
    }

    pub fn reset(&mut self) {
        *self = Self::default();
    }
}
