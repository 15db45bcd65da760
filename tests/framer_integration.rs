//! Integration tests for the access-unit framer's boundary properties
//! (spec §8: round-trip / idempotence, boundary behavior).

use vidpipe::framer::AccessUnitFramer;

fn nal(nal_type: u8, first_mb_high: bool) -> Vec<u8> {
    let mut v = vec![0, 0, 0, 1, nal_type];
    v.push(if first_mb_high { 0x80 } else { 0x00 });
    v
}

fn access_unit(nal_type: u8, payload: &[u8]) -> Vec<u8> {
    let mut unit = nal(nal_type, true);
    unit.extend_from_slice(payload);
    unit
}

const AUD: [u8; 6] = [0, 0, 0, 1, 9, 0x80];

#[test]
fn empty_stream_yields_zero_emissions() {
    let mut framer = AccessUnitFramer::new();
    let mut units: Vec<Vec<u8>> = Vec::new();
    framer.feed(&[], |u| units.push(u.to_vec())).unwrap();
    assert!(units.is_empty());
}

// The pipeline appends a trailing AUD after every packet it writes to the
// h264 sink (spec §4.5 step 6). The AUD that terminates one access unit is
// also, per the scanning algorithm, the start code the next unit's scan
// begins from — so every unit but the stream's first one arrives with that
// boundary AUD as its own leading six bytes. This matches
// `h264_process_frames` in the original daemon (`data = next` after each
// `store_frame` call) byte for byte.
#[test]
fn concatenated_units_round_trip_byte_identical() {
    let unit_a = access_unit(5, &[0xAA; 4096]);
    let unit_b = access_unit(1, &[0xBB; 8192]);

    let mut stream = Vec::new();
    stream.extend_from_slice(&unit_a);
    stream.extend_from_slice(&AUD);
    stream.extend_from_slice(&unit_b);
    stream.extend_from_slice(&AUD);

    let mut framer = AccessUnitFramer::new();
    let mut units = Vec::new();
    framer.feed(&stream, |u| units.push(u.to_vec())).unwrap();

    let mut expected_unit_b = AUD.to_vec();
    expected_unit_b.extend_from_slice(&unit_b);

    assert_eq!(units.len(), 2);
    assert_eq!(units[0], unit_a);
    assert_eq!(units[1], expected_unit_b);
    for unit in &units {
        assert_eq!(&unit[..4], &[0, 0, 0, 1]);
    }
}

#[test]
fn split_input_across_five_chunks_emits_exactly_two_units() {
    let unit_a = access_unit(5, &[0xAA; 5000]);
    let unit_b = access_unit(1, &[0xBB; 7000]);

    let mut stream = Vec::new();
    stream.extend_from_slice(&unit_a);
    stream.extend_from_slice(&AUD);
    stream.extend_from_slice(&unit_b);
    stream.extend_from_slice(&AUD);

    // Five non-unit-aligned chunks.
    let chunk_bounds = [0, 777, 3333, 6001, 9999, stream.len()];
    let mut framer = AccessUnitFramer::new();
    let mut units = Vec::new();

    for w in chunk_bounds.windows(2) {
        framer
            .feed(&stream[w[0]..w[1]], |u| units.push(u.to_vec()))
            .unwrap();
    }

    let mut expected_unit_b = AUD.to_vec();
    expected_unit_b.extend_from_slice(&unit_b);

    assert_eq!(units.len(), 2);
    assert_eq!(units[0], unit_a);
    assert_eq!(units[1], expected_unit_b);
}

#[test]
fn no_emission_until_boundary_after_second_unit_observed() {
    let unit_a = access_unit(5, &[0xAA; 100]);
    let unit_b = access_unit(1, &[0xBB; 100]);

    let mut framer = AccessUnitFramer::new();
    let mut units = Vec::new();

    framer.feed(&unit_a, |u| units.push(u.to_vec())).unwrap();
    assert!(units.is_empty(), "first unit alone must not emit before its boundary is seen");

    framer.feed(&AUD, |u| units.push(u.to_vec())).unwrap();
    assert_eq!(units.len(), 1);

    framer.feed(&unit_b, |u| units.push(u.to_vec())).unwrap();
    assert_eq!(units.len(), 1, "second unit must not emit until its own boundary arrives");
}

#[test]
fn isolated_aud_closes_pending_unit_deterministically() {
    let unit_a = access_unit(5, &[0xAA; 64]);

    let mut framer = AccessUnitFramer::new();
    let mut units = Vec::new();
    framer.feed(&unit_a, |u| units.push(u.to_vec())).unwrap();
    framer.feed(&AUD, |u| units.push(u.to_vec())).unwrap();

    assert_eq!(units.len(), 1);
    assert_eq!(units[0], unit_a);
}
