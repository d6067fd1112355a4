//! Great-circle distance used by the webhook geofence.

use crate::model::Coordinates;

pub const EARTH_RADIUS_KM: f64 = 6371.0;

/// Haversine distance in kilometers. NaN inputs yield NaN.
#[must_use]
pub fn distance_km(a: Coordinates, b: Coordinates) -> f64 {
    let lat1 = a.lat.to_radians();
    let lat2 = b.lat.to_radians();
    let delta_lat = (b.lat - a.lat).to_radians();
    let delta_lng = (b.lng - a.lng).to_radians();

    let h = (delta_lat / 2.0).sin().powi(2)
        + lat1.cos() * lat2.cos() * (delta_lng / 2.0).sin().powi(2);

    let c = 2.0 * h.sqrt().atan2((1.0 - h).sqrt());

    EARTH_RADIUS_KM * c
}

/// True when `current` lies within `radius_km` of `target`. NaN never satisfies.
#[must_use]
pub fn within_radius(current: Coordinates, target: Coordinates, radius_km: f64) -> bool {
    distance_km(current, target) <= radius_km
}
