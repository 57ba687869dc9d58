pub mod inspection;
pub mod skim;

use serde::Serialize;

use crate::constants::SECTOR_BYTES;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    Forward,
    Backward,
}

impl std::fmt::Display for Direction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Direction::Forward => f.write_str("forward"),
            Direction::Backward => f.write_str("backward"),
        }
    }
}

/// Geometry of one close-inspection reader.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct InspectionDescriptor {
    pub id: u64,
    pub direction: Direction,
    /// Device offset of the match that triggered the inspection.
    pub origin_offset: u64,
    /// Where the reader starts; below the origin for backward readers.
    pub actual_start_offset: u64,
    /// Sectors this reader scans.
    pub sector_limit: u64,
    /// Configured reach, in sectors, on either side of the origin.
    pub span: u64,
}

impl InspectionDescriptor {
    /// Backward readers stop at the origin, so a span reaching below offset
    /// zero is clamped and the reader scans fewer sectors.
    pub fn new(id: u64, direction: Direction, origin_offset: u64, span: u64) -> Self {
        let reach = span.saturating_mul(SECTOR_BYTES);
        let (actual_start_offset, sector_limit) = match direction {
            Direction::Forward => (origin_offset, span),
            Direction::Backward => {
                let start = origin_offset.saturating_sub(reach);
                (start, (origin_offset - start) / SECTOR_BYTES)
            }
        };
        Self {
            id,
            direction,
            origin_offset,
            actual_start_offset,
            sector_limit,
            span,
        }
    }

    /// Address window `[origin - span, origin + span)` in bytes: the sectors
    /// the pair actually reads.
    pub fn window(&self) -> (u64, u64) {
        let reach = self.span.saturating_mul(SECTOR_BYTES);
        (
            self.origin_offset.saturating_sub(reach),
            self.origin_offset.saturating_add(reach),
        )
    }

    pub fn covers(&self, offset: u64) -> bool {
        let (low, high) = self.window();
        low <= offset && offset < high
    }

    pub fn label(&self) -> String {
        format!("{}@{:#x}", self.direction, self.origin_offset)
    }
}
