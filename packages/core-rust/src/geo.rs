//! Spherical geometry used by `$nearSphere` and `$within` in both evaluators.

use crate::types::GeoPoint;

/// Mean earth radius in miles, used to convert `$maxDistanceInMiles`.
pub const EARTH_RADIUS_MILES: f64 = 3959.0;

/// Mean earth radius in kilometers, used to convert `$maxDistanceInKilometers`.
pub const EARTH_RADIUS_KILOMETERS: f64 = 6371.0;

#[must_use]
pub fn miles_to_radians(miles: f64) -> f64 {
    miles / EARTH_RADIUS_MILES
}

#[must_use]
pub fn kilometers_to_radians(kilometers: f64) -> f64 {
    kilometers / EARTH_RADIUS_KILOMETERS
}

/// The `$nearSphere` distance keys, highest precedence first. When a
/// constraint carries several, only the first present one applies.
pub const MAX_DISTANCE_KEYS: [&str; 4] = [
    "$maxDistance",
    "$maxDistanceInKilometers",
    "$maxDistanceInMiles",
    "$maxDistanceInRadians",
];

/// Converts the amount of one of [`MAX_DISTANCE_KEYS`] to radians.
#[must_use]
pub fn distance_in_radians(key: &str, amount: f64) -> f64 {
    match key {
        "$maxDistanceInMiles" => miles_to_radians(amount),
        "$maxDistanceInKilometers" => kilometers_to_radians(amount),
        _ => amount,
    }
}

/// The distance key that applies among `present` keys.
#[must_use]
pub fn applicable_distance_key<'a, I>(present: I) -> Option<&'static str>
where
    I: IntoIterator<Item = &'a str>,
{
    let present: Vec<&str> = present.into_iter().collect();
    MAX_DISTANCE_KEYS
        .into_iter()
        .find(|key| present.contains(key))
}

impl GeoPoint {
    #[must_use]
    pub fn new(longitude: f64, latitude: f64) -> Self {
        Self { longitude, latitude }
    }

    /// Great-circle distance in radians:
    /// `acos(cos(y1)cos(y2)cos(x1-x2) + sin(y1)sin(y2))`.
    #[must_use]
    pub fn radians_to(&self, other: &GeoPoint) -> f64 {
        let (x1, y1) = (self.longitude.to_radians(), self.latitude.to_radians());
        let (x2, y2) = (other.longitude.to_radians(), other.latitude.to_radians());
        let cos_angle = y1.cos() * y2.cos() * (x1 - x2).cos() + y1.sin() * y2.sin();
        // Rounding can push identical points just past 1.0.
        cos_angle.clamp(-1.0, 1.0).acos()
    }

    /// Axis-aligned bounding test against a `[southwest, northeast]` box.
    #[must_use]
    pub fn within_box(&self, southwest: &GeoPoint, northeast: &GeoPoint) -> bool {
        self.latitude >= southwest.latitude
            && self.latitude <= northeast.latitude
            && self.longitude >= southwest.longitude
            && self.longitude <= northeast.longitude
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identical_points_are_zero_apart() {
        let p = GeoPoint::new(116.397, 39.909);
        assert!(p.radians_to(&p).abs() < 1e-9);
    }

    #[test]
    fn quarter_circle_along_equator() {
        let a = GeoPoint::new(0.0, 0.0);
        let b = GeoPoint::new(90.0, 0.0);
        assert!((a.radians_to(&b) - std::f64::consts::FRAC_PI_2).abs() < 1e-9);
    }

    #[test]
    fn unit_conversions() {
        assert!((miles_to_radians(3959.0) - 1.0).abs() < 1e-12);
        assert!((kilometers_to_radians(6371.0) - 1.0).abs() < 1e-12);
    }

    #[test]
    fn plain_max_distance_outranks_unit_keys() {
        let keys = ["$maxDistanceInRadians", "$maxDistanceInMiles"];
        assert_eq!(applicable_distance_key(keys), Some("$maxDistanceInMiles"));
        let keys = ["$maxDistanceInKilometers", "$maxDistance", "$nearSphere"];
        assert_eq!(applicable_distance_key(keys), Some("$maxDistance"));
        assert_eq!(applicable_distance_key(["$nearSphere"]), None);
        assert!((distance_in_radians("$maxDistanceInMiles", 3959.0) - 1.0).abs() < 1e-12);
    }

    #[test]
    fn box_bounds_are_inclusive() {
        let sw = GeoPoint::new(-10.0, -10.0);
        let ne = GeoPoint::new(10.0, 10.0);
        assert!(GeoPoint::new(10.0, -10.0).within_box(&sw, &ne));
        assert!(!GeoPoint::new(10.5, 0.0).within_box(&sw, &ne));
    }
}
