// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use proptest::prelude::*;
use sandvm::{LinearMemory, MemoryType, Trap, WASM_PAGE_SIZE};

fn memory(minimum: u32, maximum: Option<u32>) -> LinearMemory {
    LinearMemory::new(MemoryType { minimum, maximum }, 64).unwrap()
}

proptest! {
    #[test]
    fn out_of_bounds_writes_change_nothing(
        pages in 0_u32..3,
        offset in 0_u64..(4 * WASM_PAGE_SIZE as u64),
        len in 0_usize..256,
    ) {
        let mut mem = memory(pages, None);
        mem.fill(0, 0x5a, mem.byte_size()).unwrap();
        let before = mem.read(0, mem.byte_size()).unwrap();

        let bytes = vec![0xa5; len];
        let in_bounds = offset as usize + len <= mem.byte_size();
        match mem.write(offset, &bytes) {
            Ok(()) => {
                prop_assert!(in_bounds);
                prop_assert_eq!(mem.read(offset, len).unwrap(), bytes);
            }
            Err(trap) => {
                prop_assert!(!in_bounds);
                prop_assert_eq!(trap, Trap::MemoryOutOfBounds);
                prop_assert_eq!(mem.read(0, mem.byte_size()).unwrap(), before);
            }
        }
    }

    #[test]
    fn reads_agree_with_bounds(
        pages in 0_u32..3,
        offset in 0_u64..(4 * WASM_PAGE_SIZE as u64),
        len in 0_usize..16,
    ) {
        let mem = memory(pages, None);
        let in_bounds = offset as usize + len <= mem.byte_size();
        prop_assert_eq!(mem.is_valid_range(offset, len), in_bounds);
        prop_assert_eq!(mem.read(offset, len).is_ok(), in_bounds);
    }

    #[test]
    fn growth_is_monotonic_and_bounded(
        minimum in 0_u32..4,
        maximum in 4_u32..8,
        deltas in proptest::collection::vec(0_u32..4, 0..8),
    ) {
        let mut mem = memory(minimum, Some(maximum));
        for delta in deltas {
            let before = mem.size();
            match mem.grow(delta) {
                Some(old) => {
                    prop_assert_eq!(old, before);
                    prop_assert_eq!(mem.size(), before + delta);
                }
                None => {
                    prop_assert!(before + delta > maximum);
                    prop_assert_eq!(mem.size(), before);
                }
            }
            prop_assert!(mem.size() >= before);
            prop_assert!(mem.size() <= maximum);
            prop_assert_eq!(mem.byte_size(), mem.size() as usize * WASM_PAGE_SIZE);
        }
    }
}

#[test]
fn grown_pages_are_zeroed() {
    let mut mem = memory(1, Some(2));
    mem.fill(0, 0xff, WASM_PAGE_SIZE).unwrap();
    assert_eq!(mem.grow(1), Some(1));
    assert_eq!(mem.read_u64_le(WASM_PAGE_SIZE as u64).unwrap(), 0);
    assert_eq!(mem.read_u8(WASM_PAGE_SIZE as u64 - 1).unwrap(), 0xff);
    assert_eq!(mem.grow(1), None);
}

#[test]
fn minimum_above_the_limit_is_rejected() {
    assert!(
        LinearMemory::new(
            MemoryType {
                minimum: 65,
                maximum: None
            },
            64
        )
        .is_none()
    );
}

#[test]
fn copies_may_overlap() {
    let mut mem = memory(1, None);
    mem.write(0, b"abcdef").unwrap();
    mem.copy_within(2, 0, 4).unwrap();
    assert_eq!(mem.read(0, 6).unwrap(), b"ababcd");
    assert_eq!(
        mem.copy_within(WASM_PAGE_SIZE as u64 - 1, 0, 2),
        Err(Trap::MemoryOutOfBounds)
    );
    assert_eq!(mem.read(0, 6).unwrap(), b"ababcd");
}
