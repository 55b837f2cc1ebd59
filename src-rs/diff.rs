use crate::canvas::{Color, ObservedWall, Position, TargetImage, COMPACT_COORD_MAX};

/// A wall position that still has to be painted, in absolute coordinates.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiffEntry {
    pub position: Position,
    pub color: Color,
}

impl DiffEntry {
    /// Whether the position can be written as a fixed-width `gw:` tag.
    pub fn fits_compact_tag(&self) -> bool {
        self.position.x <= COMPACT_COORD_MAX && self.position.y <= COMPACT_COORD_MAX
    }
}

/// Every target pixel the observed wall doesn't already show.
///
/// Entries come out column by column (x outer, y inner), so the result is
/// stable for a given wall and target.
pub fn compute_diff(wall: &ObservedWall, target: &TargetImage) -> Vec<DiffEntry> {
    let mut diff = Vec::new();
    for x in 0..target.width() {
        for y in 0..target.height() {
            let Some(wanted) = target.color_at(Position::new(x, y)) else {
                continue;
            };
            let position = target.to_absolute(Position::new(x, y));
            if wall.get(position) != Some(wanted) {
                diff.push(DiffEntry {
                    position,
                    color: wanted.clone(),
                });
            }
        }
    }
    diff
}
