//! Packet-loss interpolation.
//!
//! Radio links drop frames. The device's packet counter tells us exactly how
//! many went missing, so instead of emitting a series with holes we rebuild
//! an evenly indexed one: missing rows are linearly interpolated, channel by
//! channel, between the last real sample before the gap and the first one
//! after it. Every emitted row carries a flag saying whether it was
//! synthesized.
//!
//! As a consequence emitted batches do not all have `n_samp` rows: a block
//! that followed a drop comes out longer.

use std::time::{SystemTime, UNIX_EPOCH};

use log::{debug, trace, warn};

use crate::protocol::{Decoder, RawBlock, EEG_CHANNELS, FS, MOTION_CHANNELS};

/// Longest run of lost frames that is filled in (10 s). Anything larger is
/// treated as a device restart or a corrupted counter.
pub const MAX_GAP: u32 = 10 * FS as u32;

/// A uniformly sampled multichannel batch.
#[derive(Debug, Clone, PartialEq)]
pub struct TimeSeries<const N: usize> {
    /// Stream identifier, e.g. `EEG_60:B6:47:E1:26:9E`.
    pub key: String,
    /// Sample rate in Hz.
    pub fs: f64,
    /// UNIX time (seconds) of the first row.
    pub offset: f64,
    pub samples: Vec<[f64; N]>,
    /// Device packet counter of each row.
    pub counters: Vec<u32>,
    /// `true` for rows synthesized to fill a drop.
    pub interpolated: Vec<bool>,
}

/// EEG in µV.
pub type Signal = TimeSeries<EEG_CHANNELS>;
/// Accelerometer (g) in columns 0-2, gyroscope (deg/s) in columns 3-5.
pub type Motion = TimeSeries<MOTION_CHANNELS>;

impl<const N: usize> TimeSeries<N> {
    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Timestamp of each row.
    pub fn timestamps(&self) -> impl Iterator<Item = f64> + '_ {
        (0..self.samples.len()).map(move |i| self.offset + i as f64 / self.fs)
    }

    /// One channel as a column.
    pub fn channel(&self, ch: usize) -> Vec<f64> {
        self.samples.iter().map(|row| row[ch]).collect()
    }
}

impl Motion {
    pub fn accel(&self) -> Vec<[f64; 3]> {
        self.samples.iter().map(|r| [r[0], r[1], r[2]]).collect()
    }

    pub fn gyro(&self) -> Vec<[f64; 3]> {
        self.samples.iter().map(|r| [r[3], r[4], r[5]]).collect()
    }
}

/// Everything produced from one block.
#[derive(Debug, Clone, PartialEq)]
pub struct Interpolated {
    pub signal: Signal,
    pub motion: Motion,
    /// Battery fraction of the block's last frame.
    pub battery: f64,
    /// Frames lost before or inside this block (0 when contiguous).
    pub dropped: u32,
}

/// Stateful drop corrector; feed it blocks in arrival order.
///
/// Not reentrant: exactly one acquisition attempt owns an instance.
#[derive(Debug, Clone)]
pub struct PacketInterpolator {
    address: String,
    last_counter: Option<i64>,
    last_eeg: Option<[f64; EEG_CHANNELS]>,
    last_motion: Option<[f64; MOTION_CHANNELS]>,
}

impl PacketInterpolator {
    /// `address` only names the output streams.
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            last_counter: None,
            last_eeg: None,
            last_motion: None,
        }
    }

    /// Counter of the last row emitted.
    pub fn last_counter(&self) -> Option<u32> {
        self.last_counter.map(|c| c as u32)
    }

    /// Forget carried state; the next block starts a new counter session.
    pub fn reset(&mut self) {
        self.last_counter = None;
        self.last_eeg = None;
        self.last_motion = None;
    }

    /// Process a block received just now.
    pub fn process(&mut self, block: &RawBlock) -> Interpolated {
        self.process_at(block, unix_now())
    }

    /// Process a block whose last frame arrived at UNIX time `now`.
    pub fn process_at(&mut self, block: &RawBlock, now: f64) -> Interpolated {
        let decoder = Decoder::new(block);
        let raw = decoder.packet_count();
        let mut eeg = decoder.eeg();
        let mut motion = decoder.motion();
        let battery = decoder.battery().last().copied().unwrap_or_default();

        if let Some(last) = self.last_counter {
            if counter_step(last as u32, raw[0]).is_none() {
                debug!(
                    "packet counter jumped from {} to {}, restarting drop accounting",
                    last as u32, raw[0]
                );
                self.reset();
            }
        }

        let (counters, interpolated, dropped) = match self.unwrap_counters(&raw) {
            Some(count) => {
                let last_in_block = count[count.len() - 1];
                let last_counter = self.last_counter.unwrap_or(count[0] - 1);
                let dropped = (last_in_block - last_counter) - count.len() as i64;

                let rows = if dropped > 0 {
                    debug!("Unicorn dropped_frames={}", dropped);

                    let mut known = Vec::with_capacity(count.len() + 1);
                    known.push(last_counter);
                    known.extend_from_slice(&count);

                    let eeg_anchor = self.last_eeg.unwrap_or(eeg[0]);
                    let motion_anchor = self.last_motion.unwrap_or(motion[0]);

                    // Unwrapped counter domain, so a gap across u32::MAX stays contiguous.
                    let axis: Vec<i64> = (last_counter..=last_in_block).collect();

                    eeg = fill_gaps(&known, eeg_anchor, &eeg, &axis);
                    motion = fill_gaps(&known, motion_anchor, &motion, &axis);

                    let counters: Vec<u32> = axis[1..].iter().map(|&c| c as u32).collect();
                    let interpolated = axis[1..]
                        .iter()
                        .map(|c| known.binary_search(c).is_err())
                        .collect();
                    (counters, interpolated)
                } else {
                    (raw.clone(), vec![false; raw.len()])
                };

                self.last_counter = Some(last_in_block);
                (rows.0, rows.1, dropped.max(0) as u32)
            }
            None => {
                warn!(
                    "inconsistent packet counters {:?}, passing block through and restarting",
                    raw
                );
                self.reset();
                self.last_counter = Some(i64::from(raw[raw.len() - 1]));
                (raw.clone(), vec![false; raw.len()], 0)
            }
        };

        self.last_eeg = eeg.last().copied();
        self.last_motion = motion.last().copied();

        let offset = now - counters.len() as f64 / FS;
        trace!(
            "block of {} frames -> {} rows at offset {:.3}",
            raw.len(),
            counters.len(),
            offset
        );

        Interpolated {
            signal: TimeSeries {
                key: format!("EEG_{}", self.address),
                fs: FS,
                offset,
                samples: eeg,
                counters: counters.clone(),
                interpolated: interpolated.clone(),
            },
            motion: TimeSeries {
                key: format!("MOTION_{}", self.address),
                fs: FS,
                offset,
                samples: motion,
                counters,
                interpolated,
            },
            battery,
            dropped,
        }
    }

    /// Map raw counters onto the session's unwrapped `i64` axis.
    ///
    /// `None` when consecutive counters repeat, step backwards, or the block
    /// implies more than [`MAX_GAP`] lost frames.
    fn unwrap_counters(&self, raw: &[u32]) -> Option<Vec<i64>> {
        let base = self
            .last_counter
            .unwrap_or_else(|| i64::from(raw[0]) - 1);

        let mut prev = base;
        let mut count = Vec::with_capacity(raw.len());
        for &c in raw {
            prev += i64::from(counter_step(prev as u32, c)?);
            count.push(prev);
        }

        let lost = (prev - base) - raw.len() as i64;
        (lost <= i64::from(MAX_GAP)).then_some(count)
    }
}

/// Forward distance from `prev` to `next` modulo 2^32, if plausible.
fn counter_step(prev: u32, next: u32) -> Option<u32> {
    let step = next.wrapping_sub(prev);
    (1..=MAX_GAP + 1).contains(&step).then_some(step)
}

/// Resample `[anchor] ++ rows` (known at counters `known`) onto `axis`,
/// dropping the anchor row from the result.
fn fill_gaps<const N: usize>(
    known: &[i64],
    anchor: [f64; N],
    rows: &[[f64; N]],
    axis: &[i64],
) -> Vec<[f64; N]> {
    let mut values = Vec::with_capacity(rows.len() + 1);
    values.push(anchor);
    values.extend_from_slice(rows);

    let mut out = Vec::with_capacity(axis.len().saturating_sub(1));
    let mut seg = 0usize;
    for &x in &axis[1..] {
        while seg + 1 < known.len() - 1 && known[seg + 1] < x {
            seg += 1;
        }
        out.push(lerp_row(known, &values, seg, x));
    }
    out
}

/// Linear interpolation between `known[seg]` and `known[seg + 1]`, clamped to
/// the end points.
fn lerp_row<const N: usize>(known: &[i64], values: &[[f64; N]], seg: usize, x: i64) -> [f64; N] {
    let (x0, x1) = (known[seg], known[seg + 1]);
    if x <= x0 {
        return values[seg];
    }
    if x >= x1 {
        return values[seg + 1];
    }
    let t = (x - x0) as f64 / (x1 - x0) as f64;
    let (a, b) = (values[seg], values[seg + 1]);
    let mut row = [0.0; N];
    for ch in 0..N {
        row[ch] = a[ch] + (b[ch] - a[ch]) * t;
    }
    row
}

fn unix_now() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{Frame, EEG_SCALE};

    fn frame(counter: u32, level: i32) -> Frame {
        Frame {
            battery: 12,
            eeg: [level; EEG_CHANNELS],
            accel: [level as i16, 0, -(level as i16)],
            gyro: [0, level as i16, 0],
            counter,
        }
    }

    fn block(counters: &[u32]) -> RawBlock {
        let frames: Vec<Frame> = counters.iter().map(|&c| frame(c, c as i32 * 10)).collect();
        RawBlock::from_frames(&frames).unwrap()
    }

    #[test]
    fn contiguous_blocks_pass_through() {
        let mut interp = PacketInterpolator::new("dev");
        let a = interp.process_at(&block(&[1, 2, 3, 4]), 100.0);
        let b = interp.process_at(&block(&[5, 6, 7, 8]), 100.016);

        for out in [&a, &b] {
            assert_eq!(out.dropped, 0);
            assert_eq!(out.signal.len(), 4);
            assert!(out.signal.interpolated.iter().all(|&i| !i));
        }
        assert_eq!(b.signal.counters, vec![5, 6, 7, 8]);
        assert_eq!(interp.last_counter(), Some(8));
    }

    #[test]
    fn fills_gap_across_block_boundary() {
        let mut interp = PacketInterpolator::new("dev");
        interp.process_at(&block(&[97, 98, 99, 100]), 0.0);

        // 101..=104 were lost.
        let out = interp.process_at(&block(&[105, 106]), 1.0);
        assert_eq!(out.dropped, 4);
        assert_eq!(out.signal.counters, vec![101, 102, 103, 104, 105, 106]);
        assert_eq!(
            out.signal.interpolated,
            vec![true, true, true, true, false, false]
        );

        // Frame levels are counter * 10 counts, so the fill lands on the same line.
        for (row, counter) in out.signal.samples.iter().zip(&out.signal.counters) {
            let expected = *counter as f64 * 10.0 * EEG_SCALE;
            assert!((row[0] - expected).abs() < 1e-9);
        }
        for (row, counter) in out.motion.accel().iter().zip(&out.motion.counters) {
            let expected = *counter as f64 * 10.0 / 4096.0;
            assert!((row[0] - expected).abs() < 1e-9);
            assert!((row[2] + expected).abs() < 1e-9);
        }
    }

    #[test]
    fn fills_gap_inside_block() {
        let mut interp = PacketInterpolator::new("dev");
        let out = interp.process_at(&block(&[10, 11, 14, 15]), 0.0);
        assert_eq!(out.dropped, 2);
        assert_eq!(out.signal.counters, vec![10, 11, 12, 13, 14, 15]);
        assert_eq!(
            out.signal.interpolated,
            vec![false, false, true, true, false, false]
        );
        let ch0 = out.signal.channel(0);
        assert!((ch0[2] - 120.0 * EEG_SCALE).abs() < 1e-9);
        assert!((ch0[3] - 130.0 * EEG_SCALE).abs() < 1e-9);
    }

    #[test]
    fn counter_regression_restarts_session() {
        let mut interp = PacketInterpolator::new("simulator");
        interp.process_at(&block(&[500, 501]), 0.0);
        let out = interp.process_at(&block(&[1, 2]), 0.0);
        assert_eq!(out.dropped, 0);
        assert_eq!(out.signal.counters, vec![1, 2]);
        assert_eq!(interp.last_counter(), Some(2));
    }

    #[test]
    fn fills_gap_across_counter_wraparound() {
        let mut interp = PacketInterpolator::new("dev");
        interp.process_at(&block(&[u32::MAX - 3, u32::MAX - 2]), 0.0);

        // MAX - 1, MAX and 0 were lost.
        let out = interp.process_at(&block(&[1, 2]), 1.0);
        assert_eq!(out.dropped, 3);
        assert_eq!(out.signal.counters, vec![u32::MAX - 1, u32::MAX, 0, 1, 2]);
        assert_eq!(
            out.signal.interpolated,
            vec![true, true, true, false, false]
        );
        assert_eq!(interp.last_counter(), Some(2));

        let next = interp.process_at(&block(&[3, 4]), 2.0);
        assert_eq!(next.dropped, 0);
        assert_eq!(next.signal.counters, vec![3, 4]);
    }

    #[test]
    fn fills_gap_inside_block_spanning_wraparound() {
        let mut interp = PacketInterpolator::new("dev");
        interp.process_at(&block(&[u32::MAX - 2]), 0.0);

        let out = interp.process_at(&block(&[u32::MAX, 1]), 1.0);
        assert_eq!(out.dropped, 2);
        assert_eq!(out.signal.counters, vec![u32::MAX - 1, u32::MAX, 0, 1]);
        assert_eq!(out.signal.interpolated, vec![true, false, true, false]);
    }

    #[test]
    fn implausible_jump_restarts_instead_of_filling() {
        let mut interp = PacketInterpolator::new("dev");
        interp.process_at(&block(&[100, 101]), 0.0);

        let jump = 101 + MAX_GAP + 2;
        let out = interp.process_at(&block(&[jump, jump + 1]), 1.0);
        assert_eq!(out.dropped, 0);
        assert_eq!(out.signal.len(), 2);
        assert_eq!(interp.last_counter(), Some(jump + 1));

        // Largest gap still filled.
        let mut interp = PacketInterpolator::new("dev");
        interp.process_at(&block(&[100]), 0.0);
        let out = interp.process_at(&block(&[101 + MAX_GAP]), 1.0);
        assert_eq!(out.dropped, MAX_GAP);
        assert_eq!(out.signal.len(), MAX_GAP as usize + 1);
    }

    #[test]
    fn corrupted_counter_inside_block_passes_through() {
        let mut interp = PacketInterpolator::new("dev");
        interp.process_at(&block(&[1, 2]), 0.0);

        let out = interp.process_at(&block(&[3, 70_000, 5]), 1.0);
        assert_eq!(out.dropped, 0);
        assert_eq!(out.signal.counters, vec![3, 70_000, 5]);
        assert!(out.signal.interpolated.iter().all(|&i| !i));

        let next = interp.process_at(&block(&[6, 7]), 2.0);
        assert_eq!(next.dropped, 0);
        assert_eq!(next.signal.counters, vec![6, 7]);
    }

    #[test]
    fn offsets_back_date_from_arrival() {
        let mut interp = PacketInterpolator::new("dev");
        let out = interp.process_at(&block(&[1, 2, 3, 4, 5]), 10.0);
        assert!((out.signal.offset - (10.0 - 5.0 / FS)).abs() < 1e-12);
        let ts: Vec<f64> = out.signal.timestamps().collect();
        assert!((ts[4] - (10.0 - 1.0 / FS)).abs() < 1e-12);
        assert_eq!(out.signal.offset, out.motion.offset);
    }

    #[test]
    fn battery_comes_from_last_frame() {
        let mut frames = vec![frame(1, 0), frame(2, 0)];
        frames[1].battery = 3;
        let block = RawBlock::from_frames(&frames).unwrap();
        let out = PacketInterpolator::new("dev").process_at(&block, 0.0);
        assert!((out.battery - 0.2).abs() < 1e-12);
    }

    #[test]
    fn keys_name_the_device() {
        let out = PacketInterpolator::new("60:B6:47:E1:26:9E").process_at(&block(&[1]), 0.0);
        assert_eq!(out.signal.key, "EEG_60:B6:47:E1:26:9E");
        assert_eq!(out.motion.key, "MOTION_60:B6:47:E1:26:9E");
    }
}
