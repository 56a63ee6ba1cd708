//! OnStream ADR cartridge geometry — logical↔physical block mapping.
//!
//! ADR tapes are serpentine: 24 parallel tracks, with successive logical
//! blocks alternating direction across tracks so the head turns around
//! instead of rewinding.  Both generations reserve one *fast lane* track
//! holding a contiguous logical run opposite to the serpentine; ADR50
//! additionally keeps a 99-frame *parking zone* in the middle of every track
//! where the drive parks the head on eject — those frames are not logically
//! addressable and split the tape into a front and a back half, each with
//! its own serpentine and fast lane.
//!
//! The logical layout is ArcServe's (observed from real dumps), not anything
//! a datasheet documents:
//!
//! - ADR30: tracks 0..=22 are tiled by 1 500-frame segments; within a
//!   1 500-frame stripe ("partition") even tracks run forward, odd tracks
//!   backward, and the track order flips on every odd partition.  Track 23
//!   is the fast lane, numbered from the far end of the tape.
//! - ADR50: the same scheme per half.  The front half starts just past the
//!   parking zone and grows outward, with track 23 as its fast lane; the
//!   back half mirrors it (tracks 23 down to 1, shrinking toward frame 0),
//!   with track 0 as its fast lane.
//!
//! The packed 32-bit physical id is `track << 24 | x`; the byte lane between
//! them must be zero and decoding rejects anything else.

use serde::Serialize;
use thiserror::Error;

// ── Geometry constants ───────────────────────────────────────────────────────

/// Track count shared by both ADR generations.
pub const TRACK_COUNT: u8 = 24;

/// Blocks per track segment — the stripe width of the serpentine tiling.
pub const BLOCKS_PER_TRACK_SEGMENT: u32 = 1_500;

/// Serpentine tracks per generation (all tracks minus the fast lane).
const SERPENTINE_TRACKS: u32 = 23;

/// Logical blocks per full partition (one stripe across all serpentine tracks).
const PARTITION_BLOCKS: u32 = BLOCKS_PER_TRACK_SEGMENT * SERPENTINE_TRACKS;

mod adr30 {
    pub const FRAMES_PER_TRACK: u32 = 19_239;
    pub const LOGICAL_BLOCK_COUNT: u32 = 461_736;
    /// First logical block of the fast lane (track 23).
    pub const FAST_LANE_START: u32 = 442_497;
    /// Stripe index of the short partition at the far end of the tape.
    pub const MAX_PARTITION: u32 = 12;
    /// Blocks per track inside the short partition.
    pub const EDGE_SEGMENT: u32 = 1_239;
}

mod adr50 {
    pub const FRAMES_PER_TRACK: u32 = 31_959;
    pub const PARKING_ZONE_FRAMES: u32 = 99;
    /// First frame of the parking zone: `(FRAMES_PER_TRACK - 99) / 2`.
    pub const PARKING_ZONE_START: u32 = 15_930;
    /// One past the last parking-zone frame.
    pub const PARKING_ZONE_END: u32 = 16_029;
    /// Addressable frames per half-track (and per fast lane).
    pub const HALF_TRACK_FRAMES: u32 = 15_930;
    pub const LOGICAL_BLOCK_COUNT: u32 = 764_640;
    /// First logical block of the back half.
    pub const HALF_SPLIT: u32 = 382_320;
    /// First logical block of the front fast lane (track 23).
    pub const LOWER_FAST_LANE_START: u32 = 366_390;
    /// First logical block of the back fast lane (track 0).
    pub const UPPER_FAST_LANE_START: u32 = 748_710;
    /// Stripe index of the short partition in each half.
    pub const MAX_PARTITION: u32 = 10;
    /// Blocks per track inside the short partition.
    pub const EDGE_SEGMENT: u32 = 930;
}

// ── Cartridge type ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum CartridgeType {
    Adr30,
    Adr50,
}

impl CartridgeType {
    pub fn track_count(self) -> u8 {
        TRACK_COUNT
    }

    pub fn frames_per_track(self) -> u32 {
        match self {
            CartridgeType::Adr30 => adr30::FRAMES_PER_TRACK,
            CartridgeType::Adr50 => adr50::FRAMES_PER_TRACK,
        }
    }

    pub fn blocks_per_track_segment(self) -> u32 {
        BLOCKS_PER_TRACK_SEGMENT
    }

    pub fn logical_block_count(self) -> u32 {
        match self {
            CartridgeType::Adr30 => adr30::LOGICAL_BLOCK_COUNT,
            CartridgeType::Adr50 => adr50::LOGICAL_BLOCK_COUNT,
        }
    }

    pub fn has_parking_zone(self) -> bool {
        matches!(self, CartridgeType::Adr50)
    }

    /// Total physical frames on the tape, parking zone included.
    pub fn total_frames(self) -> u32 {
        u32::from(TRACK_COUNT) * self.frames_per_track()
    }
}

impl std::fmt::Display for CartridgeType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CartridgeType::Adr30 => write!(f, "ADR30"),
            CartridgeType::Adr50 => write!(f, "ADR50"),
        }
    }
}

// ── Errors ───────────────────────────────────────────────────────────────────

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PositionError {
    #[error("logical block {logical} is outside the cartridge capacity of {capacity}")]
    LogicalOutOfRange { logical: u32, capacity: u32 },
    #[error("physical id {id:#010x} has non-zero bits in the reserved byte lane")]
    BadPhysicalId { id: u32 },
    #[error("frame coordinate (track {track}, x {x}) is off the tape")]
    OffTape { track: u8, x: u32 },
    #[error("position (track {track}, x {x}) is inside the parking zone")]
    ParkingZone { track: u8, x: u16 },
    #[error("{op} is not defined for {cartridge}")]
    Unsupported { cartridge: CartridgeType, op: &'static str },
}

// ── Location (ADR50) ─────────────────────────────────────────────────────────

/// Which third of an ADR50 track a frame falls in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Location {
    BackHalf,
    ParkingZone,
    FrontHalf,
}

// ── PhysicalPosition ─────────────────────────────────────────────────────────

/// A physical head position: track plus frame index along the tape.
///
/// Constructed only through [`from_logical`](Self::from_logical) or
/// [`from_physical`](Self::from_physical); mutated only through the
/// `try_increase_*` walkers.  Clone for snapshots — the copy is just
/// `{track, x}` plus the cartridge tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PhysicalPosition {
    cartridge: CartridgeType,
    track:     u8,
    x:         u16,
}

impl PhysicalPosition {
    // ── Constructors ─────────────────────────────────────────────────────────

    pub fn from_logical(cartridge: CartridgeType, logical: u32) -> Result<Self, PositionError> {
        let capacity = cartridge.logical_block_count();
        if logical >= capacity {
            return Err(PositionError::LogicalOutOfRange { logical, capacity });
        }
        let (track, x) = match cartridge {
            CartridgeType::Adr30 => adr30_from_logical(logical),
            CartridgeType::Adr50 => adr50_from_logical(logical),
        };
        Ok(Self { cartridge, track, x: x as u16 })
    }

    /// Decode a packed physical id.  The byte lane between `track` and `x`
    /// must be zero; anything else is corrupt aux data, not a position.
    pub fn from_physical(cartridge: CartridgeType, id: u32) -> Result<Self, PositionError> {
        if id & 0x00FF_0000 != 0 {
            return Err(PositionError::BadPhysicalId { id });
        }
        let track = (id >> 24) as u8;
        let x = id & 0xFFFF;
        if track >= TRACK_COUNT || x >= cartridge.frames_per_track() {
            return Err(PositionError::OffTape { track, x });
        }
        Ok(Self { cartridge, track, x: x as u16 })
    }

    // ── Accessors ────────────────────────────────────────────────────────────

    pub fn cartridge(&self) -> CartridgeType {
        self.cartridge
    }

    pub fn track(&self) -> u8 {
        self.track
    }

    pub fn x(&self) -> u16 {
        self.x
    }

    /// Pack into the 32-bit on-tape physical id.
    pub fn to_physical(&self) -> u32 {
        (u32::from(self.track) << 24) | u32::from(self.x)
    }

    pub fn to_logical(&self) -> Result<u32, PositionError> {
        match self.cartridge {
            CartridgeType::Adr30 => Ok(adr30_to_logical(self.track, u32::from(self.x))),
            CartridgeType::Adr50 => {
                let x = u32::from(self.x);
                if (adr50::PARKING_ZONE_START..adr50::PARKING_ZONE_END).contains(&x) {
                    return Err(PositionError::ParkingZone { track: self.track, x: self.x });
                }
                Ok(adr50_to_logical(self.track, x))
            }
        }
    }

    /// Which third of the track this frame falls in.  ADR30 has no parking
    /// zone and therefore no location concept.
    pub fn location(&self) -> Result<Location, PositionError> {
        match self.cartridge {
            CartridgeType::Adr30 => Err(PositionError::Unsupported {
                cartridge: self.cartridge,
                op: "location",
            }),
            CartridgeType::Adr50 => {
                let x = u32::from(self.x);
                Ok(if x < adr50::PARKING_ZONE_START {
                    Location::BackHalf
                } else if x < adr50::PARKING_ZONE_END {
                    Location::ParkingZone
                } else {
                    Location::FrontHalf
                })
            }
        }
    }

    pub fn is_parking_zone(&self) -> Result<bool, PositionError> {
        Ok(self.location()? == Location::ParkingZone)
    }

    // ── Walkers ──────────────────────────────────────────────────────────────

    /// Advance one frame along the physical serpentine: straight until the
    /// end of the track, then turn around onto the next track.  Returns
    /// `false` at the end of the tape.
    ///
    /// For ADR50, `skip_parking_zone` hops over the parking zone the way the
    /// ArcServe reader does; without it the zone is walked like ordinary
    /// frames.  The wrap from track 23 back to track 0 is empirical — it
    /// matches observed dumps, not any published geometry.
    pub fn try_increase_physical_block(&mut self, skip_parking_zone: bool) -> bool {
        match self.cartridge {
            CartridgeType::Adr30 => self.adr30_increase(),
            CartridgeType::Adr50 => self.adr50_increase(skip_parking_zone),
        }
    }

    fn adr30_increase(&mut self) -> bool {
        let last = (adr30::FRAMES_PER_TRACK - 1) as u16;
        if self.track % 2 == 0 {
            if self.x < last {
                self.x += 1;
            } else {
                self.track += 1;
            }
            true
        } else if self.x > 0 {
            self.x -= 1;
            true
        } else if self.track == TRACK_COUNT - 1 {
            false
        } else {
            self.track += 1;
            true
        }
    }

    fn adr50_increase(&mut self, skip_parking_zone: bool) -> bool {
        let last = (adr50::FRAMES_PER_TRACK - 1) as u16;
        let pz_start = adr50::PARKING_ZONE_START as u16;
        let pz_end = adr50::PARKING_ZONE_END as u16;
        if self.track % 2 == 0 {
            if skip_parking_zone && self.x == pz_start - 1 {
                if self.track == 0 {
                    // Wrapped back onto track 0: the next frame would be the
                    // front half again.
                    return false;
                }
                self.x = pz_end;
                return true;
            }
            if !skip_parking_zone && self.track == 0 && self.x == pz_end - 1 {
                return false;
            }
            if self.x < last {
                self.x += 1;
            } else {
                self.track += 1;
            }
            true
        } else {
            if skip_parking_zone && self.x == pz_end {
                self.x = pz_start - 1;
                return true;
            }
            if self.x > 0 {
                self.x -= 1;
            } else if self.track == TRACK_COUNT - 1 {
                self.track = 0; // empirical wrap onto the back fast lane track
            } else {
                self.track += 1;
            }
            true
        }
    }

    /// Advance one logical block.  Returns `false` at capacity, or when the
    /// current position has no logical number (ADR50 parking zone).
    pub fn try_increase_logical_block(&mut self) -> bool {
        let Ok(logical) = self.to_logical() else {
            return false;
        };
        let next = logical + 1;
        if next >= self.cartridge.logical_block_count() {
            return false;
        }
        match Self::from_logical(self.cartridge, next) {
            Ok(p) => {
                *self = p;
                true
            }
            Err(_) => false,
        }
    }
}

impl std::fmt::Display for PhysicalPosition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "track {}, frame {}", self.track, self.x)
    }
}

// ── ADR30 mapping ────────────────────────────────────────────────────────────

fn adr30_from_logical(logical: u32) -> (u8, u32) {
    if logical >= adr30::FAST_LANE_START {
        // Fast lane runs from the far end of the tape toward frame 0.
        return (TRACK_COUNT - 1, adr30::LOGICAL_BLOCK_COUNT - 1 - logical);
    }
    let partition = logical / PARTITION_BLOCKS;
    let rem = logical % PARTITION_BLOCKS;
    let blocks = segment_width(partition, adr30::MAX_PARTITION, adr30::EDGE_SEGMENT);
    let lane = rem / blocks;
    let local = rem % blocks;
    let track = serpentine_track(partition, lane);
    let base = BLOCKS_PER_TRACK_SEGMENT * partition;
    let x = if track % 2 == 0 { base + local } else { base + blocks - local - 1 };
    (track as u8, x)
}

fn adr30_to_logical(track: u8, x: u32) -> u32 {
    if track == TRACK_COUNT - 1 {
        return adr30::LOGICAL_BLOCK_COUNT - 1 - x;
    }
    let partition = x / BLOCKS_PER_TRACK_SEGMENT;
    let blocks = segment_width(partition, adr30::MAX_PARTITION, adr30::EDGE_SEGMENT);
    let offset = x - BLOCKS_PER_TRACK_SEGMENT * partition;
    let local = if track % 2 == 0 { offset } else { blocks - offset - 1 };
    let lane = serpentine_lane(partition, u32::from(track));
    partition * PARTITION_BLOCKS + lane * blocks + local
}

// ── ADR50 mapping ────────────────────────────────────────────────────────────

fn adr50_from_logical(logical: u32) -> (u8, u32) {
    if logical < adr50::LOWER_FAST_LANE_START {
        // Front-half serpentine, growing outward from the parking zone.
        let partition = logical / PARTITION_BLOCKS;
        let rem = logical % PARTITION_BLOCKS;
        let blocks = segment_width(partition, adr50::MAX_PARTITION, adr50::EDGE_SEGMENT);
        let lane = rem / blocks;
        let local = rem % blocks;
        let track = serpentine_track(partition, lane);
        let base = adr50::PARKING_ZONE_END + BLOCKS_PER_TRACK_SEGMENT * partition;
        let x = if track % 2 == 0 { base + local } else { base + blocks - local - 1 };
        (track as u8, x)
    } else if logical < adr50::HALF_SPLIT {
        // Front fast lane, numbered from the far end toward the parking zone.
        let offset = logical - adr50::LOWER_FAST_LANE_START;
        (TRACK_COUNT - 1, adr50::FRAMES_PER_TRACK - offset - 1)
    } else if logical < adr50::UPPER_FAST_LANE_START {
        // Back-half serpentine: mirror of the front, tracks 23 down to 1,
        // shrinking from the parking zone toward frame 0.
        let rel = logical - adr50::HALF_SPLIT;
        let partition = rel / PARTITION_BLOCKS;
        let rem = rel % PARTITION_BLOCKS;
        let blocks = segment_width(partition, adr50::MAX_PARTITION, adr50::EDGE_SEGMENT);
        let lane = rem / blocks;
        let local = rem % blocks;
        let track = if partition % 2 == 0 { 23 - lane } else { 1 + lane };
        let top = adr50::PARKING_ZONE_START - 1 - BLOCKS_PER_TRACK_SEGMENT * partition;
        let x = if track % 2 == 1 { top - local } else { top - (blocks - local - 1) };
        (track as u8, x)
    } else {
        // Back fast lane on track 0, growing toward the parking zone.
        (0, logical - adr50::UPPER_FAST_LANE_START)
    }
}

fn adr50_to_logical(track: u8, x: u32) -> u32 {
    if x >= adr50::PARKING_ZONE_END {
        if track == TRACK_COUNT - 1 {
            return adr50::LOWER_FAST_LANE_START + (adr50::FRAMES_PER_TRACK - 1 - x);
        }
        let rel = x - adr50::PARKING_ZONE_END;
        let partition = rel / BLOCKS_PER_TRACK_SEGMENT;
        let blocks = segment_width(partition, adr50::MAX_PARTITION, adr50::EDGE_SEGMENT);
        let offset = rel - BLOCKS_PER_TRACK_SEGMENT * partition;
        let local = if track % 2 == 0 { offset } else { blocks - offset - 1 };
        let lane = serpentine_lane(partition, u32::from(track));
        partition * PARTITION_BLOCKS + lane * blocks + local
    } else {
        if track == 0 {
            return adr50::UPPER_FAST_LANE_START + x;
        }
        let rel = adr50::PARKING_ZONE_START - 1 - x;
        let partition = rel / BLOCKS_PER_TRACK_SEGMENT;
        let blocks = segment_width(partition, adr50::MAX_PARTITION, adr50::EDGE_SEGMENT);
        let offset = rel - BLOCKS_PER_TRACK_SEGMENT * partition;
        let local = if track % 2 == 1 { offset } else { blocks - offset - 1 };
        let lane = if partition % 2 == 0 {
            23 - u32::from(track)
        } else {
            u32::from(track) - 1
        };
        adr50::HALF_SPLIT + partition * PARTITION_BLOCKS + lane * blocks + local
    }
}

// ── Shared serpentine helpers ────────────────────────────────────────────────

fn segment_width(partition: u32, max_partition: u32, edge_segment: u32) -> u32 {
    if partition == max_partition {
        edge_segment
    } else {
        BLOCKS_PER_TRACK_SEGMENT
    }
}

/// Track for a serpentine lane index: even partitions run 0..=22, odd 22..=0.
fn serpentine_track(partition: u32, lane: u32) -> u32 {
    if partition % 2 == 0 {
        lane
    } else {
        SERPENTINE_TRACKS - 1 - lane
    }
}

/// Inverse of [`serpentine_track`].
fn serpentine_lane(partition: u32, track: u32) -> u32 {
    if partition % 2 == 0 {
        track
    } else {
        SERPENTINE_TRACKS - 1 - track
    }
}

// ── Tests ────────────────────────────────────────────────────────────────────
