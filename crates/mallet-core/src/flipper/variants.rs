//! Loop-based hammer kernels: the access+flush reference loop, the
//! TRRespass refresh-aligned loop and the inline-assembly loop.

use std::arch::asm;

use super::{flush_line, mfence, rdtscp};

/// Reference algorithm: read one word from each aggressor, then evict each
/// from the cache, `hammer_count` times.
pub(crate) fn hammer_default(aggs: &[*mut u8], hammer_count: u64, use_clflushopt: bool) {
    for _ in 0..hammer_count {
        for &agg in aggs {
            unsafe {
                std::hint::black_box(std::ptr::read_volatile(agg));
            }
        }
        for &agg in aggs {
            flush_line(agg, use_clflushopt);
        }
    }
}

/// TRRespass-style loop: an optional rdtscp-delta busy loop approximates
/// alignment to the refresh, then each iteration is fenced before the
/// read-all and flush-all phases.
pub(crate) fn hammer_trrespass(
    aggs: &[*mut u8],
    hammer_count: u64,
    threshold: u64,
    use_clflushopt: bool,
) {
    unsafe { libc::sched_yield() };

    if threshold > 0 {
        // threshold value depends on the system
        let (mut t0, mut t1) = (0u64, 0u64);
        while (t1 as i64 - t0 as i64).unsigned_abs() < threshold {
            t0 = rdtscp();
            unsafe {
                std::hint::black_box(std::ptr::read_volatile(aggs[0]));
            }
            flush_line(aggs[0], use_clflushopt);
            t1 = rdtscp();
        }
    }

    for _ in 0..hammer_count {
        mfence();
        for &agg in aggs {
            unsafe {
                std::hint::black_box(std::ptr::read_volatile(agg));
            }
        }
        for &agg in aggs {
            flush_line(agg, use_clflushopt);
        }
    }
}

/// Inline-assembly loop.
///
/// With only legacy `clflush`, experiments produce the most bit flips when
/// the flush directly follows each access; with `clflushopt` available, when
/// all aggressors are accessed before any is flushed.
pub(crate) fn hammer_assembly(aggs: &[*mut u8], hammer_count: u64, use_clflushopt: bool) {
    if use_clflushopt {
        for _ in 0..hammer_count {
            for &agg in aggs {
                unsafe {
                    asm!(
                        "mov {tmp}, [{agg}]",
                        agg = in(reg) agg,
                        tmp = out(reg) _,
                        options(nostack),
                    );
                }
            }
            for &agg in aggs {
                unsafe {
                    asm!(
                        "clflushopt [{agg}]",
                        agg = in(reg) agg,
                        options(nostack),
                    );
                }
            }
        }
    } else {
        for _ in 0..hammer_count {
            for &agg in aggs {
                unsafe {
                    asm!(
                        "mov {tmp}, [{agg}]",
                        "clflush [{agg}]",
                        agg = in(reg) agg,
                        tmp = out(reg) _,
                        options(nostack),
                    );
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::util::ROW_SIZE;

    fn rows() -> (Vec<u8>, Vec<*mut u8>) {
        let mut buffer = vec![0xa5u8; 2 * ROW_SIZE];
        let aggs = vec![buffer.as_mut_ptr(), unsafe {
            buffer.as_mut_ptr().byte_add(ROW_SIZE)
        }];
        (buffer, aggs)
    }

    #[test]
    fn test_default_loop_runs() {
        let (_buffer, aggs) = rows();
        hammer_default(&aggs, 1_000, false);
    }

    #[test]
    fn test_trrespass_without_threshold() {
        let (_buffer, aggs) = rows();
        hammer_trrespass(&aggs, 1_000, 0, false);
    }

    #[test]
    fn test_assembly_loop_runs() {
        let (_buffer, aggs) = rows();
        hammer_assembly(&aggs, 1_000, false);
        if std::arch::is_x86_feature_detected!("clflushopt") {
            hammer_assembly(&aggs, 1_000, true);
        }
    }
}
