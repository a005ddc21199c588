//! Intersection detection between visible output series.
//!
//! An approximate, per-segment root finder: for each unordered pair of
//! visible series the difference is checked for a sign change between
//! adjacent samples and the crossing is linearly interpolated. Multiple true
//! crossings inside one segment are undetectable by construction. Complexity
//! is `O(V^2 * N)` over V visible series and N samples.

use serde::{Deserialize, Serialize};

use crate::schema::OutputVariable;
use crate::simulation::{round2, DataPoint, SimulationData};

pub const INTERSECTION_LABEL: &str = "Intersection";
pub const INTERSECTION_COLOR: &str = "#ff0000";

/// Spurious-crossing guard: the left-endpoint difference must stay below
/// this, so a sign flip across a numerically huge discontinuity (a pole,
/// say) is not reported as a crossing.
pub const DISCONTINUITY_GUARD: f64 = 1000.0;

/// A detected crossing between two visible output series.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Intersection {
    /// Primary-variable position, rounded to 2 decimals.
    pub x: f64,
    /// Series value at the crossing, rounded to 2 decimals.
    pub y: f64,
    pub label: String,
    pub color: String,
}

/// Scans every unordered pair of visible series for crossings.
///
/// Requires at least two visible outputs; with fewer the result is empty
/// regardless of the dataset. Segments with missing or non-finite values
/// are skipped.
pub fn find_intersections(data: &SimulationData, visible: &[OutputVariable]) -> Vec<Intersection> {
    let mut markers = Vec::new();
    if visible.len() < 2 {
        return markers;
    }
    let Some(primary) = &data.primary else {
        return markers;
    };

    for (i, first) in visible.iter().enumerate() {
        for second in &visible[i + 1..] {
            scan_pair(
                &data.points,
                &primary.symbol,
                &first.symbol,
                &second.symbol,
                &mut markers,
            );
        }
    }
    markers
}

struct Segment {
    x1: f64,
    x2: f64,
    ya1: f64,
    ya2: f64,
    yb1: f64,
    yb2: f64,
}

impl Segment {
    /// Reads one adjacent sample pair; `None` when any value is missing or
    /// non-finite.
    fn read(p1: &DataPoint, p2: &DataPoint, primary: &str, a: &str, b: &str) -> Option<Self> {
        let segment = Self {
            x1: *p1.get(primary)?,
            x2: *p2.get(primary)?,
            ya1: *p1.get(a)?,
            ya2: *p2.get(a)?,
            yb1: *p1.get(b)?,
            yb2: *p2.get(b)?,
        };
        let finite = segment.x1.is_finite()
            && segment.x2.is_finite()
            && segment.ya1.is_finite()
            && segment.ya2.is_finite()
            && segment.yb1.is_finite()
            && segment.yb2.is_finite();
        finite.then_some(segment)
    }
}

/// Sign-change criterion with an explicit tie-break: a zero difference at
/// the right endpoint registers on the segment entering it, a zero at the
/// left endpoint never registers, and a segment with both differences zero
/// registers nothing. An exact-sample crossing is therefore reported once.
fn crosses(diff1: f64, diff2: f64) -> bool {
    (diff1 > 0.0 && diff2 < 0.0)
        || (diff1 < 0.0 && diff2 > 0.0)
        || (diff1 != 0.0 && diff2 == 0.0)
}

fn scan_pair(
    points: &[DataPoint],
    primary: &str,
    a: &str,
    b: &str,
    markers: &mut Vec<Intersection>,
) {
    for pair in points.windows(2) {
        let Some(seg) = Segment::read(&pair[0], &pair[1], primary, a, b) else {
            continue;
        };

        let diff1 = seg.ya1 - seg.yb1;
        let diff2 = seg.ya2 - seg.yb2;
        if !crosses(diff1, diff2) || diff1.abs() >= DISCONTINUITY_GUARD {
            continue;
        }

        let fraction = diff1.abs() / (diff1.abs() + diff2.abs());
        markers.push(Intersection {
            x: round2(seg.x1 + fraction * (seg.x2 - seg.x1)),
            y: round2(seg.ya1 + fraction * (seg.ya2 - seg.ya1)),
            label: INTERSECTION_LABEL.to_string(),
            color: INTERSECTION_COLOR.to_string(),
        });
    }
}
