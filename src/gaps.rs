//! Missing-frame census for a dumped cartridge.
//!
//! Walks the full physical serpentine (parking zone included) and groups
//! consecutive absent frames into gaps.  Gaps are reported in approximate
//! tape order — sorted by the midpoint proxy `start.x + end.x`, then by
//! starting track — with a still-open trailing gap appended last, since an
//! unterminated run at the end of the walk usually means the capture simply
//! stopped there.

use serde::Serialize;
use tracing::info;

use crate::cartridge::{CartridgeType, PhysicalPosition, PositionError};
use crate::tape::BlockMap;

/// One contiguous run of missing frames.  `end` is inclusive.
#[derive(Debug, Clone, Copy)]
pub struct Gap {
    pub start:       PhysicalPosition,
    pub end:         PhysicalPosition,
    pub block_count: u32,
    /// The walk ended inside this gap.
    pub open_ended:  bool,
}

/// Flat, serializable form of a [`Gap`] for report output.
#[derive(Debug, Clone, Serialize)]
pub struct GapRecord {
    pub start_track: u8,
    pub start_x:     u16,
    pub end_track:   u8,
    pub end_x:       u16,
    pub block_count: u32,
    pub open_ended:  bool,
}

impl From<&Gap> for GapRecord {
    fn from(gap: &Gap) -> Self {
        Self {
            start_track: gap.start.track(),
            start_x: gap.start.x(),
            end_track: gap.end.track(),
            end_x: gap.end.x(),
            block_count: gap.block_count,
            open_ended: gap.open_ended,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct GapReport {
    pub cartridge:      CartridgeType,
    pub frames_present: usize,
    pub frames_missing: u64,
    pub gaps:           Vec<GapRecord>,
}

/// Compute all gaps in `map`, in report order.
pub fn find_gaps(map: &BlockMap) -> Result<Vec<Gap>, PositionError> {
    let cartridge = map.cartridge();
    let frames_per_track = cartridge.frames_per_track() as usize;
    let mut present = vec![false; cartridge.total_frames() as usize];
    for (&id, _) in map.iter() {
        if let Ok(p) = PhysicalPosition::from_physical(cartridge, id) {
            present[p.track() as usize * frames_per_track + p.x() as usize] = true;
        }
    }

    let mut gaps: Vec<Gap> = Vec::new();
    let mut current: Option<Gap> = None;
    let mut pos = PhysicalPosition::from_logical(cartridge, 0)?;
    loop {
        let cell = pos.track() as usize * frames_per_track + pos.x() as usize;
        if present[cell] {
            if let Some(gap) = current.take() {
                gaps.push(gap);
            }
        } else {
            match &mut current {
                Some(gap) => {
                    gap.end = pos;
                    gap.block_count += 1;
                }
                None => {
                    current = Some(Gap { start: pos, end: pos, block_count: 1, open_ended: false })
                }
            }
        }
        if !pos.try_increase_physical_block(false) {
            break;
        }
    }

    // Midpoint proxy keeps gaps in rough tape order regardless of which
    // serpentine pass they fell on.
    gaps.sort_by_key(|g| (u32::from(g.start.x()) + u32::from(g.end.x()), g.start.track()));

    if let Some(mut trailing) = current.take() {
        trailing.open_ended = true;
        gaps.push(trailing);
    }
    Ok(gaps)
}

/// Build the serializable report and log a human-readable summary.
pub fn report(map: &BlockMap) -> Result<GapReport, PositionError> {
    let gaps = find_gaps(map)?;
    let frames_missing: u64 = gaps.iter().map(|g| u64::from(g.block_count)).sum();
    info!(
        "{}: {} frame(s) captured, {} missing across {} gap(s)",
        map.cartridge(),
        map.len(),
        frames_missing,
        gaps.len()
    );
    for gap in &gaps {
        info!(
            "  gap: {} .. {} ({} block(s){})",
            gap.start,
            gap.end,
            gap.block_count,
            if gap.open_ended { ", open at end of tape" } else { "" }
        );
    }
    Ok(GapReport {
        cartridge: map.cartridge(),
        frames_present: map.len(),
        frames_missing,
        gaps: gaps.iter().map(GapRecord::from).collect(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tape::test_support::raw_frame;
    use crate::tape::BlockMap;

    const SIG: u32 = 0x4144_5230;

    fn adr30_map_with_logical(present: impl Iterator<Item = u32>) -> BlockMap {
        let mut dump = Vec::new();
        for logical in present {
            let id = PhysicalPosition::from_logical(CartridgeType::Adr30, logical)
                .unwrap()
                .to_physical();
            dump.extend(raw_frame(0, SIG, id));
        }
        let mut map = BlockMap::new(CartridgeType::Adr30);
        map.ingest(&dump[..], "test").unwrap();
        map
    }

    #[test]
    fn fully_missing_tape_is_one_open_gap() {
        let map = BlockMap::new(CartridgeType::Adr30);
        let gaps = find_gaps(&map).unwrap();
        assert_eq!(gaps.len(), 1);
        assert_eq!(gaps[0].block_count, CartridgeType::Adr30.total_frames());
        assert!(gaps[0].open_ended);
    }

    #[test]
    fn interior_hole_is_a_closed_gap() {
        // Present: physical walk positions 0..10 except the hole at 3..5.
        let mut walk = PhysicalPosition::from_logical(CartridgeType::Adr30, 0).unwrap();
        let mut ids = Vec::new();
        for i in 0..10u32 {
            if !(3..5).contains(&i) {
                ids.push(walk.to_physical());
            }
            walk.try_increase_physical_block(false);
        }
        let mut dump = Vec::new();
        for id in ids {
            dump.extend(raw_frame(0, SIG, id));
        }
        let mut map = BlockMap::new(CartridgeType::Adr30);
        map.ingest(&dump[..], "test").unwrap();

        let gaps = find_gaps(&map).unwrap();
        // One interior 2-frame gap, plus the open-ended remainder of the tape.
        assert_eq!(gaps.len(), 2);
        let interior = gaps.iter().find(|g| !g.open_ended).unwrap();
        assert_eq!(interior.block_count, 2);
        assert_eq!(interior.start.x(), 3);
        assert_eq!(interior.end.x(), 4);
    }

    #[test]
    fn trailing_gap_sorts_last() {
        // Everything present except a hole near the front and the tape tail.
        let map = adr30_map_with_logical((0..100).filter(|l| *l != 50));
        let gaps = find_gaps(&map).unwrap();
        assert!(gaps.last().unwrap().open_ended);
        assert!(gaps.iter().filter(|g| g.open_ended).count() == 1);
    }

    #[test]
    fn report_totals_add_up() {
        let map = adr30_map_with_logical(0..10);
        let report = report(&map).unwrap();
        let gap_total: u64 = report.gaps.iter().map(|g| u64::from(g.block_count)).sum();
        assert_eq!(report.frames_missing, gap_total);
        assert_eq!(
            report.frames_missing + report.frames_present as u64,
            u64::from(CartridgeType::Adr30.total_frames())
        );
    }
}
