//! Fuzz target for tile slicing with arbitrary geometry.

#![no_main]

use libfuzzer_sys::fuzz_target;
use tilefuse::slice::fuzz_slice_invariants;

fuzz_target!(|input: (u16, u16, u16, u16, u8, u8)| {
    let (width, height, tile_width, tile_height, overlap_w, overlap_h) = input;
    let _ = fuzz_slice_invariants(
        width as u32,
        height as u32,
        tile_width as u32,
        tile_height as u32,
        overlap_w as f64 / 256.0,
        overlap_h as f64 / 256.0,
    );
});
