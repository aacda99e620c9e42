// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Native stack segments for compiled code.
//!
//! Compiled code never runs on the embedder's stack. The outermost invocation on a thread
//! switches to a fresh segment and whenever a function finds the remaining space below
//! [`RED_ZONE`] it continues on a new one, so only the call depth and the stack slot budget
//! limit how deep guest code can recurse.

use core::cell::Cell;
use core::ptr;

/// Size of one segment.
const SEGMENT_SIZE: usize = 8 * 1024 * 1024;
/// Space kept free at the bottom of every segment. It has to hold the largest frame a function
/// may have, plus the host functions and builtins called from the frame that found the limit
/// not yet reached.
const RED_ZONE: usize = 2 * 1024 * 1024;

std::thread_local! {
    /// The limit of the segment the current thread runs compiled code on, `0` outside of it.
    static LIMIT: Cell<usize> = const { Cell::new(0) };
}

/// Runs `f` with the stack limit compiled code has to check against.
///
/// The outermost invocation on a thread gets a fresh segment, invocations nested inside host
/// functions continue on the segment they were called on. `None` if no segment could be
/// allocated.
pub(super) fn with_stack<R>(f: impl FnOnce(usize) -> R) -> Option<R> {
    match LIMIT.get() {
        0 => on_new_segment(f),
        limit => Some(f(limit)),
    }
}

/// Runs `f` on a newly allocated segment, passing it the segment's limit.
pub(super) fn on_new_segment<R>(f: impl FnOnce(usize) -> R) -> Option<R> {
    sys::on_stack(SEGMENT_SIZE, || {
        let marker = 0_u8;
        let top = ptr::from_ref(&marker) as usize;
        let limit = top.saturating_sub(SEGMENT_SIZE - RED_ZONE).max(1);

        let _guard = LimitGuard::set(limit);
        f(limit)
    })
}

/// Restores the previous limit when compiled code leaves a segment, also by unwinding.
struct LimitGuard(usize);

impl LimitGuard {
    fn set(limit: usize) -> Self {
        Self(LIMIT.replace(limit))
    }
}

impl Drop for LimitGuard {
    fn drop(&mut self) {
        LIMIT.set(self.0);
    }
}

cfg_if::cfg_if! {
    if #[cfg(all(unix, target_arch = "x86_64"))] {
        mod sys {
            use corosensei::stack::DefaultStack;

            pub(super) fn on_stack<R>(size: usize, f: impl FnOnce() -> R) -> Option<R> {
                match DefaultStack::new(size) {
                    Ok(stack) => Some(corosensei::on_stack(stack, f)),
                    Err(e) => {
                        tracing::warn!(%e, size, "failed to allocate stack segment");
                        None
                    }
                }
            }
        }
    } else {
        mod sys {
            pub(super) fn on_stack<R>(_size: usize, _f: impl FnOnce() -> R) -> Option<R> {
                None
            }
        }
    }
}

#[cfg(all(test, unix, target_arch = "x86_64"))]
mod tests {
    use super::*;

    #[test]
    fn nested_invocations_share_the_segment() {
        let (outer, inner) = with_stack(|outer| {
            let inner = with_stack(|inner| inner).unwrap();
            (outer, inner)
        })
        .unwrap();
        assert_eq!(outer, inner);
        assert_eq!(LIMIT.get(), 0);
    }

    #[test]
    fn new_segments_restore_the_outer_limit() {
        with_stack(|outer| {
            let inner = on_new_segment(|inner| {
                assert_eq!(LIMIT.get(), inner);
                inner
            })
            .unwrap();
            assert_ne!(outer, inner);
            assert_eq!(LIMIT.get(), outer);
        })
        .unwrap();
    }

    #[test]
    fn segments_have_room_below_the_limit() {
        on_new_segment(|limit| {
            let marker = 0_u8;
            let sp = ptr::from_ref(&marker) as usize;
            assert!(sp > limit);
            assert!(sp - limit >= SEGMENT_SIZE - RED_ZONE - 64 * 1024);
        })
        .unwrap();
    }
}
