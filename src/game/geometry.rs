//! 2-D points and segments used by hitbox and bounce math

use std::f64::consts::PI;
use std::ops::{Add, Sub};

use serde::{Deserialize, Serialize};

/// A point (or vector) in screen space, +y pointing down
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Point {
    pub x: f64,
    pub y: f64,
}

impl Point {
    pub const ZERO: Point = Point { x: 0.0, y: 0.0 };

    pub const fn new(x: f64, y: f64) -> Self {
        Self { x, y }
    }

    /// Complex multiplication, i.e. rotate-and-scale by `other`
    pub fn mul(self, other: Point) -> Point {
        Point::new(
            self.x * other.x - self.y * other.y,
            self.x * other.y + self.y * other.x,
        )
    }

    pub fn scale(self, factor: f64) -> Point {
        Point::new(self.x * factor, self.y * factor)
    }

    /// Vector length
    pub fn modulus(self) -> f64 {
        self.x.hypot(self.y)
    }

    pub fn arg(self) -> f64 {
        self.y.atan2(self.x)
    }

    pub fn polar(r: f64, theta: f64) -> Point {
        Point::new(r * theta.cos(), r * theta.sin())
    }

    pub fn distance(self, other: Point) -> f64 {
        (self - other).modulus()
    }
}

impl Add for Point {
    type Output = Point;

    fn add(self, rhs: Point) -> Point {
        Point::new(self.x + rhs.x, self.y + rhs.y)
    }
}

impl Sub for Point {
    type Output = Point;

    fn sub(self, rhs: Point) -> Point {
        Point::new(self.x - rhs.x, self.y - rhs.y)
    }
}

/// Closed line segment between two points
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Segment {
    pub start: Point,
    pub end: Point,
}

impl Segment {
    pub fn new(start: Point, end: Point) -> Self {
        Self { start, end }
    }

    /// Whether a ray cast from `p` toward +x crosses this segment.
    ///
    /// Uses a half-open vertical rule so a ray passing exactly through a
    /// shared vertex is counted once, and decides the side with the sign of
    /// the cross product instead of computing the intersection.
    pub fn crosses_ray_right(&self, p: Point) -> bool {
        let (a, b) = (self.start, self.end);
        if (a.y > p.y) == (b.y > p.y) {
            return false;
        }
        let cross = (b.x - a.x) * (p.y - a.y) - (b.y - a.y) * (p.x - a.x);
        (cross > 0.0) == (b.y > a.y)
    }
}

/// Convert a heading in degrees to radians in the clockwise screen convention
pub fn heading_radians(degrees: f64) -> f64 {
    degrees * PI / -180.0
}

/// Velocity for a heading in degrees: `speed * (cos, sin)(heading * PI / -180)`
pub fn heading_vector(heading: f64, speed: f64) -> Point {
    Point::polar(speed, heading_radians(heading))
}

/// Rotate `p` about `center` by `theta` radians
pub fn rotate_point(p: Point, center: Point, theta: f64) -> Point {
    (p - center).mul(Point::new(theta.cos(), theta.sin())) + center
}

/// Ray-cast point-in-polygon test over a closed ring of edges
pub fn polygon_contains(edges: &[Segment], p: Point) -> bool {
    edges.iter().filter(|edge| edge.crosses_ray_right(p)).count() % 2 == 1
}
