use serde::{Deserialize, Serialize};
use geo::Point;

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct GeoPoint {
    pub latitude: f64,
    pub longitude: f64,
}

impl From<Point> for GeoPoint {
    fn from(point: Point) -> Self {
        Self {
            latitude: point.y(),
            longitude: point.x(),
        }
    }
}

impl From<GeoPoint> for Point {
    fn from(geo_point: GeoPoint) -> Self {
        Point::new(geo_point.longitude, geo_point.latitude)
    }
}

pub mod audit;
pub mod events;
pub mod plan;
pub mod policy;
pub mod risk;
pub mod section;
pub mod twin;

pub use audit::*;
pub use events::*;
pub use plan::*;
pub use policy::*;
pub use risk::*;
pub use section::*;
pub use twin::*;
