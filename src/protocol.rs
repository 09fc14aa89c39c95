//! Unicorn Bluetooth payload decoding.
//!
//! The headset streams fixed 45-byte frames at 250 Hz once acquisition is
//! started. Each frame carries one sample of every sensor plus a 32-bit
//! packet counter:
//!
//! | bytes   | field                                   |
//! |---------|-----------------------------------------|
//! | 0..2    | header (ignored)                        |
//! | 2..3    | battery level, low nibble (0-15)        |
//! | 3..27   | EEG, 8 x 24-bit signed, big-endian      |
//! | 27..33  | accelerometer, 3 x 16-bit signed        |
//! | 33..39  | gyroscope, 3 x 16-bit signed            |
//! | 39..43  | packet counter, u32 little-endian       |
//! | 43..45  | footer (ignored)                        |
//!
//! The device does NOT send timestamps. Gaps in the packet counter are the
//! only indication that frames were lost over the radio link.

use crate::errors::{DriverError, Result};

// ============================================================================
// Constants
// ============================================================================

/// RFCOMM channel the headset listens on.
pub const PORT: u8 = 1;

/// Sampling rate fixed by the device firmware.
pub const FS: f64 = 250.0;

/// Size of one frame on the wire.
pub const PAYLOAD_LENGTH: usize = 45;

pub const EEG_CHANNELS: usize = 8;
pub const BYTES_PER_EEG_CHANNEL: usize = 3;
pub const ACC_CHANNELS: usize = 3;
pub const BYTES_PER_ACC_CHANNEL: usize = 2;
pub const GYR_CHANNELS: usize = 3;
pub const BYTES_PER_GYR_CHANNEL: usize = 2;
pub const MOTION_CHANNELS: usize = ACC_CHANNELS + GYR_CHANNELS;

const HEADER_OFFSET: usize = 0;
const HEADER_LENGTH: usize = 2;
const BATTERY_OFFSET: usize = HEADER_OFFSET + HEADER_LENGTH;
const BATTERY_LENGTH: usize = 1;
const EEG_OFFSET: usize = BATTERY_OFFSET + BATTERY_LENGTH;
const EEG_LENGTH: usize = EEG_CHANNELS * BYTES_PER_EEG_CHANNEL;
const ACC_OFFSET: usize = EEG_OFFSET + EEG_LENGTH;
const ACC_LENGTH: usize = ACC_CHANNELS * BYTES_PER_ACC_CHANNEL;
const GYR_OFFSET: usize = ACC_OFFSET + ACC_LENGTH;
const GYR_LENGTH: usize = GYR_CHANNELS * BYTES_PER_GYR_CHANNEL;
const COUNT_OFFSET: usize = GYR_OFFSET + GYR_LENGTH;
const COUNT_LENGTH: usize = 4;
const FOOTER_OFFSET: usize = COUNT_OFFSET + COUNT_LENGTH;
const FOOTER_LENGTH: usize = 2;

const _: () = assert!(FOOTER_OFFSET + FOOTER_LENGTH == PAYLOAD_LENGTH);

const HEADER: [u8; HEADER_LENGTH] = [0xC0, 0x00];
const FOOTER: [u8; FOOTER_LENGTH] = [0x0D, 0x0A];

// Unicorn protocol commands
pub const START_ACQUISITION: [u8; 3] = [0x61, 0x7C, 0x87];
pub const STOP_ACQUISITION: [u8; 3] = [0x63, 0x5C, 0xC5];
/// Length of the acknowledgement the device may send after a command.
pub const ACK_LENGTH: usize = 3;

/// µV per ADC count.
pub const EEG_SCALE: f64 = 4_500_000.0 / 50_331_642.0;
/// g per ADC count.
pub const ACC_SCALE: f64 = 1.0 / 4096.0;
/// deg/s per ADC count.
pub const GYR_SCALE: f64 = 1.0 / 32.8;

const MOTION_SCALE: [f64; MOTION_CHANNELS] = [
    ACC_SCALE, ACC_SCALE, ACC_SCALE, GYR_SCALE, GYR_SCALE, GYR_SCALE,
];

/// Full-scale value of the battery nibble.
const BATTERY_FULL: f64 = 15.0;

// ============================================================================
// Data Types
// ============================================================================

/// A contiguous run of whole frames as read from the device.
///
/// The length is always a non-zero multiple of [`PAYLOAD_LENGTH`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawBlock {
    bytes: Vec<u8>,
}

impl RawBlock {
    /// Wrap a buffer, rejecting anything that is not made of whole frames.
    pub fn new(bytes: Vec<u8>) -> Result<Self> {
        if bytes.is_empty() || bytes.len() % PAYLOAD_LENGTH != 0 {
            return Err(DriverError::Protocol(format!(
                "block of {} bytes is not a multiple of the {}-byte payload",
                bytes.len(),
                PAYLOAD_LENGTH
            )));
        }
        Ok(Self { bytes })
    }

    /// Wrap a buffer filled by a full-length read of `PAYLOAD_LENGTH * n` bytes.
    pub(crate) fn from_full_read(bytes: Vec<u8>) -> Self {
        debug_assert!(
            !bytes.is_empty() && bytes.len() % PAYLOAD_LENGTH == 0,
            "full read returned {} bytes",
            bytes.len()
        );
        Self { bytes }
    }

    /// Concatenate encoded frames into a block.
    pub fn from_frames(frames: &[Frame]) -> Result<Self> {
        let bytes = frames.iter().flat_map(|f| f.to_bytes()).collect();
        Self::new(bytes)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// Number of frames in the block.
    pub fn n_frames(&self) -> usize {
        self.bytes.len() / PAYLOAD_LENGTH
    }

    /// Iterate over the 45-byte payloads.
    pub fn payloads(&self) -> impl Iterator<Item = &[u8]> {
        self.bytes.chunks_exact(PAYLOAD_LENGTH)
    }
}

/// A single decoded frame, in ADC units.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Frame {
    /// Battery nibble (0-15).
    pub battery: u8,
    /// EEG channels, 24-bit signed counts.
    pub eeg: [i32; EEG_CHANNELS],
    /// Accelerometer X, Y, Z counts.
    pub accel: [i16; ACC_CHANNELS],
    /// Gyroscope counts.
    pub gyro: [i16; GYR_CHANNELS],
    /// Device packet counter.
    pub counter: u32,
}

impl Frame {
    /// Decode one 45-byte payload.
    pub fn parse(payload: &[u8]) -> Self {
        debug_assert_eq!(payload.len(), PAYLOAD_LENGTH);

        let battery = payload[BATTERY_OFFSET] & 0x0F;

        let mut eeg = [0i32; EEG_CHANNELS];
        let eeg_bytes = &payload[EEG_OFFSET..EEG_OFFSET + EEG_LENGTH];
        for (value, raw) in eeg
            .iter_mut()
            .zip(eeg_bytes.chunks_exact(BYTES_PER_EEG_CHANNEL))
        {
            *value = sign_extend_24([raw[0], raw[1], raw[2]]);
        }

        let mut accel = [0i16; ACC_CHANNELS];
        let acc_bytes = &payload[ACC_OFFSET..ACC_OFFSET + ACC_LENGTH];
        for (value, raw) in accel
            .iter_mut()
            .zip(acc_bytes.chunks_exact(BYTES_PER_ACC_CHANNEL))
        {
            *value = i16::from_le_bytes([raw[0], raw[1]]);
        }

        let mut gyro = [0i16; GYR_CHANNELS];
        let gyr_bytes = &payload[GYR_OFFSET..GYR_OFFSET + GYR_LENGTH];
        for (value, raw) in gyro
            .iter_mut()
            .zip(gyr_bytes.chunks_exact(BYTES_PER_GYR_CHANNEL))
        {
            *value = i16::from_le_bytes([raw[0], raw[1]]);
        }

        let c = &payload[COUNT_OFFSET..FOOTER_OFFSET];
        let counter = u32::from_le_bytes([c[0], c[1], c[2], c[3]]);

        Self {
            battery,
            eeg,
            accel,
            gyro,
            counter,
        }
    }

    /// Encode the frame back into its wire representation.
    ///
    /// EEG values are truncated to 24 bits and the battery to its low nibble.
    pub fn to_bytes(&self) -> [u8; PAYLOAD_LENGTH] {
        let mut out = [0u8; PAYLOAD_LENGTH];
        out[HEADER_OFFSET..BATTERY_OFFSET].copy_from_slice(&HEADER);
        out[BATTERY_OFFSET] = self.battery & 0x0F;

        for (ch, value) in self.eeg.iter().enumerate() {
            let at = EEG_OFFSET + ch * BYTES_PER_EEG_CHANNEL;
            out[at..at + BYTES_PER_EEG_CHANNEL].copy_from_slice(&value.to_be_bytes()[1..]);
        }
        for (ch, value) in self.accel.iter().enumerate() {
            let at = ACC_OFFSET + ch * BYTES_PER_ACC_CHANNEL;
            out[at..at + BYTES_PER_ACC_CHANNEL].copy_from_slice(&value.to_le_bytes());
        }
        for (ch, value) in self.gyro.iter().enumerate() {
            let at = GYR_OFFSET + ch * BYTES_PER_GYR_CHANNEL;
            out[at..at + BYTES_PER_GYR_CHANNEL].copy_from_slice(&value.to_le_bytes());
        }

        out[COUNT_OFFSET..FOOTER_OFFSET].copy_from_slice(&self.counter.to_le_bytes());
        out[FOOTER_OFFSET..].copy_from_slice(&FOOTER);
        out
    }

    /// Accelerometer followed by gyroscope, in ADC units.
    pub fn motion_counts(&self) -> [i16; MOTION_CHANNELS] {
        let mut out = [0i16; MOTION_CHANNELS];
        out[..ACC_CHANNELS].copy_from_slice(&self.accel);
        out[ACC_CHANNELS..].copy_from_slice(&self.gyro);
        out
    }
}

/// Sign-extend a big-endian 24-bit value by replicating bit 23 into a fourth byte.
#[inline]
fn sign_extend_24(raw: [u8; 3]) -> i32 {
    let ext = if raw[0] & 0x80 != 0 { 0xFF } else { 0x00 };
    i32::from_be_bytes([ext, raw[0], raw[1], raw[2]])
}

// ============================================================================
// Decoder
// ============================================================================

/// Pure decoder over a [`RawBlock`].
///
/// Every accessor returns one entry per frame, in arrival order.
#[derive(Debug, Clone)]
pub struct Decoder {
    frames: Vec<Frame>,
}

impl Decoder {
    pub fn new(block: &RawBlock) -> Self {
        Self {
            frames: block.payloads().map(Frame::parse).collect(),
        }
    }

    pub fn n_frames(&self) -> usize {
        self.frames.len()
    }

    pub fn frames(&self) -> &[Frame] {
        &self.frames
    }

    /// EEG in µV, one row of 8 channels per frame.
    pub fn eeg(&self) -> Vec<[f64; EEG_CHANNELS]> {
        self.frames
            .iter()
            .map(|f| f.eeg.map(|v| v as f64 * EEG_SCALE))
            .collect()
    }

    /// EEG in raw ADC counts.
    pub fn eeg_counts(&self) -> Vec<[i32; EEG_CHANNELS]> {
        self.frames.iter().map(|f| f.eeg).collect()
    }

    /// Accelerometer (g) then gyroscope (deg/s), one row of 6 channels per frame.
    ///
    /// Both sensors are decoded in one pass; use [`Decoder::accel`] and
    /// [`Decoder::gyro`] for the split view.
    pub fn motion(&self) -> Vec<[f64; MOTION_CHANNELS]> {
        self.frames
            .iter()
            .map(|f| {
                let counts = f.motion_counts();
                let mut row = [0.0; MOTION_CHANNELS];
                for (ch, value) in row.iter_mut().enumerate() {
                    *value = counts[ch] as f64 * MOTION_SCALE[ch];
                }
                row
            })
            .collect()
    }

    /// Motion in raw ADC counts.
    pub fn motion_counts(&self) -> Vec<[i16; MOTION_CHANNELS]> {
        self.frames.iter().map(Frame::motion_counts).collect()
    }

    /// Accelerometer in g.
    pub fn accel(&self) -> Vec<[f64; ACC_CHANNELS]> {
        self.frames
            .iter()
            .map(|f| f.accel.map(|v| v as f64 * ACC_SCALE))
            .collect()
    }

    /// Gyroscope in deg/s.
    pub fn gyro(&self) -> Vec<[f64; GYR_CHANNELS]> {
        self.frames
            .iter()
            .map(|f| f.gyro.map(|v| v as f64 * GYR_SCALE))
            .collect()
    }

    /// Battery level as a fraction (0.0 - 1.0).
    pub fn battery(&self) -> Vec<f64> {
        self.frames
            .iter()
            .map(|f| f.battery as f64 / BATTERY_FULL)
            .collect()
    }

    /// Battery nibble (0-15).
    pub fn battery_counts(&self) -> Vec<u8> {
        self.frames.iter().map(|f| f.battery).collect()
    }

    /// Device packet counters.
    pub fn packet_count(&self) -> Vec<u32> {
        self.frames.iter().map(|f| f.counter).collect()
    }
}
