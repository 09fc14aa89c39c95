use proptest::prelude::*;
use unicorn_rs::protocol::{ACK_LENGTH, PAYLOAD_LENGTH, START_ACQUISITION, STOP_ACQUISITION};
use unicorn_rs::{Decoder, DriverError, Frame, RawBlock};

const EXAMPLE: [u8; PAYLOAD_LENGTH] = [
    0xC0, 0x00, 0x0F, 0x00, 0x9F, 0xAF, 0x00, 0x9F, 0xD4, 0x00, 0xA0, 0x40, 0x00, 0x9F, 0x43,
    0x00, 0x9F, 0x9A, 0x00, 0x9F, 0xE3, 0x00, 0x9F, 0x85, 0x00, 0x9F, 0xBB, 0x2E, 0xF6, 0xE9,
    0x02, 0x8D, 0xF2, 0xF3, 0xFF, 0xEF, 0xFF, 0x23, 0x00, 0xB0, 0x00, 0x00, 0x00, 0x0D, 0x0A,
];

#[test]
fn command_bytes_match_the_device_protocol() {
    assert_eq!(START_ACQUISITION, [0x61, 0x7C, 0x87]);
    assert_eq!(STOP_ACQUISITION, [0x63, 0x5C, 0xC5]);
    assert_eq!(ACK_LENGTH, 3);
}

#[test]
fn decodes_a_block_through_the_public_api() {
    let mut bytes = EXAMPLE.to_vec();
    let mut next = Frame::parse(&EXAMPLE);
    next.counter += 1;
    bytes.extend_from_slice(&next.to_bytes());

    let block = RawBlock::new(bytes).unwrap();
    assert_eq!(block.n_frames(), 2);

    let decoder = Decoder::new(&block);
    assert_eq!(decoder.packet_count(), vec![176, 177]);
    assert_eq!(decoder.eeg()[0], decoder.eeg()[1]);
    assert!((decoder.eeg()[0][0] - 3654.87).abs() < 0.005);
    assert!((decoder.accel()[0][0] + 0.614).abs() < 0.0005);
}

#[test]
fn rejects_trailing_bytes() {
    let mut bytes = EXAMPLE.to_vec();
    bytes.push(0);
    assert!(matches!(RawBlock::new(bytes), Err(DriverError::Protocol(_))));
}

fn frame() -> impl Strategy<Value = Frame> {
    (
        0u8..16,
        prop::array::uniform8(-8_388_608i32..=8_388_607),
        prop::array::uniform3(any::<i16>()),
        prop::array::uniform3(any::<i16>()),
        any::<u32>(),
    )
        .prop_map(|(battery, eeg, accel, gyro, counter)| Frame {
            battery,
            eeg,
            accel,
            gyro,
            counter,
        })
}

proptest! {
    #[test]
    fn whole_frames_decode_one_row_each(frames in prop::collection::vec(frame(), 1..64)) {
        let block = RawBlock::from_frames(&frames).unwrap();
        prop_assert_eq!(block.as_bytes().len(), frames.len() * PAYLOAD_LENGTH);

        let decoder = Decoder::new(&block);
        prop_assert_eq!(decoder.n_frames(), frames.len());
        prop_assert_eq!(decoder.eeg().len(), frames.len());
        prop_assert_eq!(decoder.motion().len(), frames.len());
        prop_assert_eq!(decoder.frames(), &frames[..]);
    }

    #[test]
    fn arbitrary_bytes_of_whole_frames_always_decode(
        n in 1usize..16,
        seed in prop::collection::vec(any::<u8>(), PAYLOAD_LENGTH),
    ) {
        let block = RawBlock::new(seed.repeat(n)).unwrap();
        let decoder = Decoder::new(&block);
        prop_assert_eq!(decoder.packet_count().len(), n);
        for level in decoder.battery() {
            prop_assert!((0.0..=1.0).contains(&level));
        }
    }
}
