//! Textual IP range expressions and de-duplicated address enumeration.
//!
//! A range list is a comma-separated set of segments.  A segment is a plain
//! address (`192.168.1.3`, `fe80::1`), an address with per-group spans
//! (`192.168.1-3.1-254`, `fe80::a-f`) or a CIDR prefix (`10.0.0.0/22`,
//! `fc00::/126`).  Overlapping segments never yield an address twice: an
//! address belongs to the first segment that contains it, which also keeps
//! enumeration deterministic across resumed cursors.
//!
//! A list is limited to [`SEGMENTS_MAX`] segments.  The cap is enforced at
//! parse time so [`volume`] can always count distinct addresses exactly;
//! longer lists are rejected instead of being admitted with approximate
//! accounting.

use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use thiserror::Error;

/// Most segments a range list may carry; see the module docs.
pub const SEGMENTS_MAX: usize = 24;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RangeParseError {
    #[error("empty range expression")]
    Empty,
    #[error("invalid address segment \"{0}\"")]
    Segment(String),
    #[error("invalid group bounds in \"{0}\"")]
    Bounds(String),
    #[error("invalid network prefix in \"{0}\"")]
    Prefix(String),
    #[error("too many range segments ({0}), the limit is {max}", max = SEGMENTS_MAX)]
    TooManySegments(usize),
}

/// One parsed range segment: an inclusive span per address group
/// (4 octet groups for IPv4, 8 hextet groups for IPv6).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IpRange {
    v6: bool,
    groups: Vec<(u32, u32)>,
}

const V4_GROUPS: usize = 4;
const V6_GROUPS: usize = 8;

impl IpRange {
    pub fn is_v6(&self) -> bool {
        self.v6
    }

    fn group_max(&self) -> u32 {
        if self.v6 {
            0xffff
        } else {
            0xff
        }
    }

    fn parse(segment: &str) -> Result<Self, RangeParseError> {
        let (addr_part, prefix) = match segment.split_once('/') {
            Some((addr, prefix)) => {
                let bits: u32 = prefix
                    .parse()
                    .map_err(|_| RangeParseError::Prefix(segment.to_string()))?;
                (addr, Some(bits))
            }
            None => (segment, None),
        };

        let v6 = addr_part.contains(':');
        let mut range = if v6 {
            Self::parse_v6(addr_part, segment)?
        } else {
            Self::parse_v4(addr_part, segment)?
        };

        if let Some(bits) = prefix {
            range.apply_prefix(bits, segment)?;
        }
        Ok(range)
    }

    fn parse_v4(addr: &str, segment: &str) -> Result<Self, RangeParseError> {
        let pieces: Vec<&str> = addr.split('.').collect();
        if pieces.len() != V4_GROUPS {
            return Err(RangeParseError::Segment(segment.to_string()));
        }
        let mut groups = Vec::with_capacity(V4_GROUPS);
        for piece in pieces {
            groups.push(parse_group(piece, 10, 0xff, segment)?);
        }
        Ok(Self { v6: false, groups })
    }

    fn parse_v6(addr: &str, segment: &str) -> Result<Self, RangeParseError> {
        let expand = |part: &str| -> Vec<String> {
            if part.is_empty() {
                Vec::new()
            } else {
                part.split(':').map(str::to_string).collect()
            }
        };

        let pieces: Vec<String> = match addr.split_once("::") {
            Some((left, right)) => {
                let (left, right) = (expand(left), expand(right));
                if left.len() + right.len() > V6_GROUPS {
                    return Err(RangeParseError::Segment(segment.to_string()));
                }
                let mut all = left;
                all.extend(std::iter::repeat("0".to_string()).take(V6_GROUPS - all.len() - right.len()));
                all.extend(right);
                all
            }
            None => expand(addr),
        };
        if pieces.len() != V6_GROUPS {
            return Err(RangeParseError::Segment(segment.to_string()));
        }
        let mut groups = Vec::with_capacity(V6_GROUPS);
        for piece in &pieces {
            groups.push(parse_group(piece, 16, 0xffff, segment)?);
        }
        Ok(Self { v6: true, groups })
    }

    fn apply_prefix(&mut self, bits: u32, segment: &str) -> Result<(), RangeParseError> {
        let group_bits: u32 = if self.v6 { 16 } else { 8 };
        let total = group_bits * self.groups.len() as u32;
        if bits > total {
            return Err(RangeParseError::Prefix(segment.to_string()));
        }
        for (idx, group) in self.groups.iter_mut().enumerate() {
            if group.0 != group.1 {
                // spans cannot be combined with a prefix
                return Err(RangeParseError::Prefix(segment.to_string()));
            }
            let covered = bits.saturating_sub(idx as u32 * group_bits).min(group_bits);
            let host = group_bits - covered;
            let mask = if host >= 32 { 0 } else { !0u32 >> (32 - group_bits) << host & (!0u32 >> (32 - group_bits)) };
            let lo = group.0 & mask;
            let hi = lo | ((1u32 << host) - 1);
            *group = (lo, hi);
        }
        Ok(())
    }

    /// Whether the address (as group values) lies inside this segment.
    fn contains(&self, groups: &[u32]) -> bool {
        self.groups.len() == groups.len()
            && self
                .groups
                .iter()
                .zip(groups)
                .all(|((lo, hi), v)| lo <= v && v <= hi)
    }

    fn volume(&self) -> u128 {
        self.groups
            .iter()
            .map(|(lo, hi)| u128::from(hi - lo + 1))
            .product()
    }

    /// Per-group intersection of two segments of the same family.
    fn intersect(&self, other: &Self) -> Option<Self> {
        if self.v6 != other.v6 {
            return None;
        }
        let mut groups = Vec::with_capacity(self.groups.len());
        for ((alo, ahi), (blo, bhi)) in self.groups.iter().zip(&other.groups) {
            let lo = (*alo).max(*blo);
            let hi = (*ahi).min(*bhi);
            if lo > hi {
                return None;
            }
            groups.push((lo, hi));
        }
        Some(Self { v6: self.v6, groups })
    }

    fn addr(&self, groups: &[u32]) -> IpAddr {
        if self.v6 {
            let mut segs = [0u16; 8];
            for (seg, v) in segs.iter_mut().zip(groups) {
                *seg = *v as u16;
            }
            IpAddr::V6(Ipv6Addr::from(segs))
        } else {
            IpAddr::V4(Ipv4Addr::new(
                groups[0] as u8,
                groups[1] as u8,
                groups[2] as u8,
                groups[3] as u8,
            ))
        }
    }
}

fn parse_group(piece: &str, radix: u32, max: u32, segment: &str) -> Result<(u32, u32), RangeParseError> {
    let parse_one = |s: &str| -> Result<u32, RangeParseError> {
        let v = u32::from_str_radix(s.trim(), radix)
            .map_err(|_| RangeParseError::Segment(segment.to_string()))?;
        if v > max {
            return Err(RangeParseError::Bounds(segment.to_string()));
        }
        Ok(v)
    };
    match piece.split_once('-') {
        Some((lo, hi)) => {
            let (lo, hi) = (parse_one(lo)?, parse_one(hi)?);
            if lo > hi {
                return Err(RangeParseError::Bounds(segment.to_string()));
            }
            Ok((lo, hi))
        }
        None => {
            let v = parse_one(piece)?;
            Ok((v, v))
        }
    }
}

impl fmt::Display for IpRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let sep = if self.v6 { ':' } else { '.' };
        for (idx, (lo, hi)) in self.groups.iter().enumerate() {
            if idx > 0 {
                f.write_fmt(format_args!("{sep}"))?;
            }
            if self.v6 {
                if lo == hi {
                    write!(f, "{lo:x}")?;
                } else {
                    write!(f, "{lo:x}-{hi:x}")?;
                }
            } else if lo == hi {
                write!(f, "{lo}")?;
            } else {
                write!(f, "{lo}-{hi}")?;
            }
        }
        Ok(())
    }
}

/// Parses a comma-separated range list of at most [`SEGMENTS_MAX`] segments.
pub fn parse_ranges(text: &str) -> Result<Vec<IpRange>, RangeParseError> {
    let mut out = Vec::new();
    for segment in text.split(',') {
        let segment = segment.trim();
        if segment.is_empty() {
            continue;
        }
        out.push(IpRange::parse(segment)?);
    }
    if out.is_empty() {
        return Err(RangeParseError::Empty);
    }
    if out.len() > SEGMENTS_MAX {
        return Err(RangeParseError::TooManySegments(out.len()));
    }
    Ok(out)
}

/// Exact count of distinct addresses across the union of the segments,
/// saturating at `u64::MAX`.  Exactness is what keeps task weights and the
/// per-address outstanding counts in agreement; the parser's segment cap is
/// what keeps this computation affordable.
pub fn volume(ranges: &[IpRange]) -> u64 {
    let n = ranges.len();
    debug_assert!(n <= SEGMENTS_MAX, "range list beyond the parser cap");
    if n == 0 || n > SEGMENTS_MAX {
        return 0;
    }
    // inclusion-exclusion over segment intersections
    let mut total: i128 = 0;
    for mask in 1u32..(1u32 << n) {
        let mut acc: Option<IpRange> = None;
        let mut dead = false;
        for (idx, range) in ranges.iter().enumerate() {
            if mask & (1 << idx) == 0 {
                continue;
            }
            acc = match acc {
                None => Some(range.clone()),
                Some(ref prev) => match prev.intersect(range) {
                    Some(next) => Some(next),
                    None => {
                        dead = true;
                        break;
                    }
                },
            };
        }
        if dead {
            continue;
        }
        if let Some(acc) = acc {
            let vol = acc.volume() as i128;
            if mask.count_ones() % 2 == 1 {
                total += vol;
            } else {
                total -= vol;
            }
        }
    }
    total.clamp(0, u64::MAX as i128) as u64
}

/// Deterministic, resumable cursor over the union of a range list.
///
/// Cloning the cursor and calling [`uniq_next`] on both clones yields the
/// same address; the same `(ranges, cursor)` pair always resumes at the
/// same point.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RangeCursor {
    range: usize,
    pos: Option<Vec<u32>>,
}

/// Yields the next address of the union not yielded before, or `None` when
/// the union is exhausted.  Duplicated addresses across overlapping
/// segments are skipped.
pub fn uniq_next(ranges: &[IpRange], cursor: &mut RangeCursor) -> Option<IpAddr> {
    loop {
        let range = ranges.get(cursor.range)?;
        let pos = match cursor.pos.take() {
            None => Some(range.groups.iter().map(|(lo, _)| *lo).collect::<Vec<u32>>()),
            Some(mut pos) => {
                if advance(range, &mut pos) {
                    Some(pos)
                } else {
                    None
                }
            }
        };
        let Some(pos) = pos else {
            cursor.range += 1;
            cursor.pos = None;
            continue;
        };
        let dup = ranges[..cursor.range].iter().any(|r| r.contains(&pos));
        let addr = range.addr(&pos);
        cursor.pos = Some(pos);
        if dup {
            continue;
        }
        return Some(addr);
    }
}

/// Odometer step through a segment's group spans; false on wrap-around.
fn advance(range: &IpRange, pos: &mut [u32]) -> bool {
    for idx in (0..pos.len()).rev() {
        if pos[idx] < range.groups[idx].1 {
            pos[idx] += 1;
            for later in idx + 1..pos.len() {
                pos[later] = range.groups[later].0;
            }
            return true;
        }
    }
    false
}

/// Collects the whole union; bounded use only (tests, small sweeps).
#[cfg(test)]
pub(crate) fn collect(ranges: &[IpRange]) -> Vec<IpAddr> {
    let mut cursor = RangeCursor::default();
    let mut out = Vec::new();
    while let Some(addr) = uniq_next(ranges, &mut cursor) {
        out.push(addr);
    }
    out
}
