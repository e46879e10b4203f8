//! Bloom filter sync ranges
//!
//! The ranges of a community partition global time: range `i` covers
//! `[time_low_i, time_low_{i+1})` and the newest range is open ended. Every
//! stored packet is added to the range holding its global time. Once the
//! newest range reaches the filter capacity a new one is started after the
//! highest global time it holds.
//!
//! Filters live as long as the community; each range salts its filter with
//! a random one-byte prefix so that false positives differ between peers.

use rand::Rng;

use crate::network::bloom::{BloomError, BloomFilter, capacity_for};
use crate::network::payload::SyncRequest;

#[derive(Debug, Clone)]
struct SyncRange {
    time_low: u64,
    highest: u64,
    count: usize,
    filter: BloomFilter,
}

/// The ranges of one community.
#[derive(Debug, Clone)]
pub struct SyncRanges {
    bits: u32,
    error_rate: f64,
    capacity: usize,
    ranges: Vec<SyncRange>,
}

impl SyncRanges {
    pub fn new<R: Rng>(bits: u32, error_rate: f64, rng: &mut R) -> Result<Self, BloomError> {
        let capacity = capacity_for(bits, error_rate)?.max(1);
        let mut ranges = Self {
            bits,
            error_rate,
            capacity,
            ranges: Vec::new(),
        };
        ranges.push_range(1, rng)?;
        Ok(ranges)
    }

    fn push_range<R: Rng>(&mut self, time_low: u64, rng: &mut R) -> Result<(), BloomError> {
        let salt: u8 = rng.gen();
        self.ranges.push(SyncRange {
            time_low,
            highest: 0,
            count: 0,
            filter: BloomFilter::with_error_rate(self.bits, self.error_rate, vec![salt])?,
        });
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.ranges.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Add a stored packet.
    pub fn add<R: Rng>(&mut self, global_time: u64, packet: &[u8], rng: &mut R) -> Result<(), BloomError> {
        if let Some(last) = self.ranges.last() {
            if last.count >= self.capacity && global_time > last.highest {
                let time_low = last.highest + 1;
                self.push_range(time_low, rng)?;
            }
        }
        let index = self
            .ranges
            .iter()
            .rposition(|r| r.time_low <= global_time)
            .unwrap_or(0);
        let range = &mut self.ranges[index];
        range.filter.add(packet);
        range.count += 1;
        range.highest = range.highest.max(global_time);
        Ok(())
    }

    /// Drop all ranges and rebuild them from `packets`, oldest first.
    pub fn rebuild<R: Rng>(&mut self, packets: &[(u64, Vec<u8>)], rng: &mut R) -> Result<(), BloomError> {
        self.ranges.clear();
        self.push_range(1, rng)?;
        for (global_time, packet) in packets {
            self.add(*global_time, packet, rng)?;
        }
        Ok(())
    }

    /// Half-normal choice over range indices, biased toward the newest.
    pub fn pick<R: Rng>(&self, rng: &mut R) -> usize {
        let newest = self.ranges.len().saturating_sub(1);
        if newest == 0 {
            return 0;
        }
        let sigma = (self.ranges.len() as f64 / 3.0).max(0.5);
        // Box-Muller
        let u1: f64 = rng.gen_range(f64::EPSILON..1.0);
        let u2: f64 = rng.gen();
        let z = (-2.0 * u1.ln()).sqrt() * (2.0 * std::f64::consts::PI * u2).cos();
        let back = (z.abs() * sigma).floor() as usize;
        newest.saturating_sub(back.min(newest))
    }

    /// The sync window of range `index`; the newest range advertises
    /// `time_high = 0`.
    pub fn request(&self, index: usize) -> Option<SyncRequest> {
        let range = self.ranges.get(index)?;
        let time_high = match self.ranges.get(index + 1) {
            Some(next) => next.time_low - 1,
            None => 0,
        };
        Some(SyncRequest {
            time_low: range.time_low,
            time_high,
            bloom: range.filter.clone(),
        })
    }

    /// `(time_low, time_high)` of every range, 0 marking the open end.
    pub fn bounds(&self) -> Vec<(u64, u64)> {
        (0..self.ranges.len())
            .map(|i| {
                let high = self.ranges.get(i + 1).map(|n| n.time_low - 1).unwrap_or(0);
                (self.ranges[i].time_low, high)
            })
            .collect()
    }

    pub fn contains(&self, global_time: u64, packet: &[u8]) -> bool {
        self.ranges
            .iter()
            .rposition(|r| r.time_low <= global_time)
            .map(|i| self.ranges[i].filter.contains(packet))
            .unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand::rngs::StdRng;

    fn ranges(bits: u32) -> (SyncRanges, StdRng) {
        let mut rng = StdRng::seed_from_u64(7);
        let ranges = SyncRanges::new(bits, 0.01, &mut rng).unwrap();
        (ranges, rng)
    }

    #[test]
    fn test_single_range_is_open_ended() {
        let (mut ranges, mut rng) = ranges(8 * 1024);
        ranges.add(3, b"p3", &mut rng).unwrap();
        let request = ranges.request(0).unwrap();
        assert_eq!((request.time_low, request.time_high), (1, 0));
        assert!(request.bloom.contains(b"p3"));
        assert!(ranges.contains(3, b"p3"));
        assert_eq!(ranges.pick(&mut rng), 0);
    }

    #[test]
    fn test_full_range_starts_new_one_without_gaps() {
        let (mut ranges, mut rng) = ranges(64);
        let capacity = ranges.capacity();
        for gt in 1..=(capacity as u64 * 3) {
            ranges.add(gt, &gt.to_be_bytes(), &mut rng).unwrap();
        }
        assert!(ranges.len() >= 3);

        let bounds = ranges.bounds();
        assert_eq!(bounds[0].0, 1);
        for pair in bounds.windows(2) {
            assert_eq!(pair[0].1 + 1, pair[1].0);
        }
        assert_eq!(bounds.last().unwrap().1, 0);

        // Late packets land in the range covering them
        ranges.add(2, b"late", &mut rng).unwrap();
        assert!(ranges.request(0).unwrap().bloom.contains(b"late"));
    }

    #[test]
    fn test_pick_prefers_newest() {
        let (mut ranges, mut rng) = ranges(64);
        let capacity = ranges.capacity() as u64;
        for gt in 1..=(capacity * 6) {
            ranges.add(gt, &gt.to_be_bytes(), &mut rng).unwrap();
        }
        let newest = ranges.len() - 1;
        let hits = (0..1000).filter(|_| ranges.pick(&mut rng) == newest).count();
        assert!(hits > 300, "newest picked {} times", hits);
        assert!((0..1000).all(|_| ranges.pick(&mut rng) <= newest));
    }

    #[test]
    fn test_rebuild() {
        let (mut ranges, mut rng) = ranges(8 * 1024);
        ranges.add(1, b"gone", &mut rng).unwrap();
        ranges.rebuild(&[(5, b"kept".to_vec())], &mut rng).unwrap();
        assert!(ranges.contains(5, b"kept"));
        assert!(!ranges.contains(1, b"gone"));
    }
}
