#![no_main]

use cros_encore::codec::h265::slice::SliceType;
use cros_encore::encoder::rps::build_rps_list;
use cros_encore::encoder::GopEntry;
use cros_encore::encoder::InterRpsPrediction;
use libfuzzer_sys::fuzz_target;

/// Reads one GOP entry per 6 bytes: POC, reference count and mask, used mask, prediction mode
/// and delta seed.
fn gop_entries(data: &[u8]) -> Vec<GopEntry> {
    data.chunks_exact(6)
        .map(|c| {
            let poc = i32::from(c[0] % 32);
            let num_refs = usize::from(c[1] % 5);
            let references = (0..num_refs)
                .map(|j| {
                    let delta = -(i32::from(c[5].wrapping_add(j as u8) % 16) + 1);
                    (delta, c[2] & (1 << j) != 0)
                })
                .collect();

            let inter_rps_prediction = match c[3] % 3 {
                0 => InterRpsPrediction::None,
                1 => InterRpsPrediction::Auto,
                _ => InterRpsPrediction::Explicit {
                    delta_rps: -i32::from(c[4] % 8) - 1,
                    ref_idc: (0..6).map(|j| (c[4] >> j) % 3).collect(),
                },
            };

            GopEntry {
                poc,
                slice_type: SliceType::B,
                num_ref_pics_active: num_refs as i32,
                references,
                inter_rps_prediction,
                ..Default::default()
            }
        })
        .collect()
}

fuzz_target!(|data: &[u8]| {
    let Some((&head, rest)) = data.split_first() else {
        return;
    };

    let entries = gop_entries(rest);
    let field_coding = head & 1 != 0;
    let extra_rps = usize::from(head >> 1) % 3;
    let gop_size = entries.len().saturating_sub(extra_rps);

    let Ok(built) = build_rps_list(&entries, gop_size, extra_rps, field_coding) else {
        return;
    };

    for rps in built.list.iter() {
        assert_eq!(
            rps.num_negative_pictures() + rps.num_positive_pictures(),
            rps.num_pictures()
        );
        if rps.inter_rps_prediction() {
            assert!(rps.is_sorted());
        }
    }
});
