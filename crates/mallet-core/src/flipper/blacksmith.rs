//! Blacksmith-style refresh-synchronized hammer kernel.
//!
//! The generated function has three sections: a timed loop over the first
//! `num_aggs_for_sync` aggressors that spins until an rdtscp delta above
//! 1000 cycles signals a refresh, the hammer section over the middle
//! aggressors in `hammer_order` with configurable flush and fence
//! scheduling, and an identical timed loop over the last aggressors that
//! counts its activations. The outer loop repeats while the activation
//! budget is positive; the sync-activation counter is the function's return
//! value.

use std::collections::HashMap;

use dynasmrt::x64::Assembler;
use dynasmrt::{DynasmApi, DynasmLabelApi, dynasm};
use log::debug;

use super::FlipperError;
use crate::config::{FencePolicy, FlushPolicy};

/// Tuning knobs of the blacksmith kernel.
pub(crate) struct BlacksmithParams<'a> {
    /// 1-based access order into the aggressor list
    pub hammer_order: &'a [u64],
    /// Aggressors per sync window
    pub num_aggs_for_sync: usize,
    /// Row-activation budget of one kernel call
    pub total_num_activations: u64,
    /// Flush scheduling
    pub flushing: FlushPolicy,
    /// Fence scheduling (`EarliestPossible` emits nothing)
    pub fencing: FencePolicy,
    /// Prefer clflushopt over clflush+lfence
    pub use_clflushopt: bool,
}

/// Flushes the line addressed by rax.
fn emit_flush(ops: &mut Assembler, use_clflushopt: bool) {
    if use_clflushopt {
        dynasm!(ops ; clflushopt [rax]);
    } else {
        dynasm!(ops ; clflush [rax] ; lfence);
    }
}

/// Emits a timed access loop over `sync_aggs` that exits once the rdtscp
/// delta around the accesses exceeds 1000 cycles (a refresh hiccup). The
/// activation counter in edx is incremented per access.
fn emit_sync_ref(ops: &mut Assembler, sync_aggs: &[u64], use_clflushopt: bool) {
    let wbegin = ops.new_dynamic_label();
    let wend = ops.new_dynamic_label();

    dynasm!(ops
        ; =>wbegin
        ; mfence
        ; lfence
        ; push rdx          // rdtscp clobbers the activation counter
        ; rdtscp            // result in edx:eax
        ; mov ebx, eax      // keep the lower 32 bits for the delta
        ; lfence
        ; pop rdx
    );

    for &agg in sync_aggs {
        dynasm!(ops
            ; mov rax, QWORD agg as i64
        );
        emit_flush(ops, use_clflushopt);
        dynasm!(ops
            ; mov rax, QWORD agg as i64
            ; mov rcx, [rax]
            // sync activations are not deducted from the budget: their count
            // varies between patterns and deducting them would cut the
            // guaranteed hammer activations short
            ; inc edx
        );
    }

    dynasm!(ops
        ; push rdx
        ; rdtscp
        ; lfence
        ; pop rdx
        ; sub eax, ebx
        ; cmp eax, 1000
        ; jg =>wend
        ; jmp =>wbegin
        ; =>wend
    );
}

/// Assembles, runs and releases the blacksmith kernel.
///
/// Returns the number of activations performed inside the trailing sync
/// loops.
///
/// # Errors
///
/// Fails when too few aggressors remain between the sync windows or when
/// assembly fails.
pub(crate) fn hammer(params: &BlacksmithParams, aggs: &[*mut u8]) -> Result<u32, FlipperError> {
    // bring the aggressors into hammering order (1-based indices)
    let ordered: Vec<u64> = params
        .hammer_order
        .iter()
        .map(|&i| aggs[i as usize - 1] as u64)
        .collect();

    let n_sync = params.num_aggs_for_sync;
    if ordered.len() <= 2 * n_sync {
        return Err(FlipperError::TooFewAggressors {
            have: ordered.len(),
            need: 2 * n_sync,
        });
    }

    let mut ops = Assembler::new().map_err(|_| FlipperError::Assemble)?;
    let start = ops.offset();

    let while1_begin = ops.new_dynamic_label();
    let while1_end = ops.new_dynamic_label();
    let for_begin = ops.new_dynamic_label();
    let for_end = ops.new_dynamic_label();

    dynasm!(ops
        ; .arch x64
        ; push rbx
    );

    // part 1: synchronize with the beginning of a refresh interval

    // warmup
    for &agg in &ordered[..n_sync] {
        dynasm!(ops
            ; mov rax, QWORD agg as i64
            ; mov rbx, [rax]
        );
    }

    dynasm!(ops ; =>while1_begin);
    for &agg in &ordered[..n_sync] {
        dynasm!(ops ; mov rax, QWORD agg as i64);
        emit_flush(&mut ops, params.use_clflushopt);
    }
    dynasm!(ops
        ; mfence
        ; rdtscp            // result in edx:eax
        ; lfence
        ; mov ebx, eax      // discard the upper 32 bits, keep the lower ones
    );
    for &agg in &ordered[..n_sync] {
        dynasm!(ops
            ; mov rax, QWORD agg as i64
            ; mov rcx, [rax]
        );
    }
    dynasm!(ops
        // if ((after - before) > 1000) break
        ; rdtscp
        ; sub eax, ebx
        ; cmp eax, 1000
        ; jg =>while1_end
        ; jmp =>while1_begin
        ; =>while1_end
    );

    // part 2: perform hammering

    dynasm!(ops
        ; mov rsi, QWORD params.total_num_activations as i64
        ; mov edx, 0        // sync-activation counter
        ; =>for_begin
        ; cmp rsi, 0
        ; jle =>for_end
    );

    let mut accessed_before: HashMap<u64, bool> = HashMap::new();
    let mut hammer_activations = 0usize;

    // hammer each middle aggressor once per outer iteration
    for &cur in &ordered[n_sync..ordered.len() - n_sync] {
        if accessed_before.get(&cur).copied().unwrap_or(false) {
            if params.flushing == FlushPolicy::LatestPossible {
                dynasm!(ops ; mov rax, QWORD cur as i64);
                emit_flush(&mut ops, params.use_clflushopt);
                accessed_before.insert(cur, false);
            }
            // fence so flushing finished and the aggressor order holds
            if params.fencing == FencePolicy::LatestPossible {
                dynasm!(ops ; mfence);
                accessed_before.insert(cur, false);
            }
        }

        dynasm!(ops
            ; mov rax, QWORD cur as i64
            ; mov rcx, [rax]
            ; dec rsi
        );
        accessed_before.insert(cur, true);
        hammer_activations += 1;

        if params.flushing == FlushPolicy::EarliestPossible {
            dynasm!(ops ; mov rax, QWORD cur as i64);
            emit_flush(&mut ops, params.use_clflushopt);
        }
    }
    debug!("{} hammer activations per kernel iteration", hammer_activations);

    // keep the aggressor order stable across the sync that follows
    dynasm!(ops ; mfence);

    // part 3: synchronize with the end of the interval
    emit_sync_ref(
        &mut ops,
        &ordered[ordered.len() - n_sync..],
        params.use_clflushopt,
    );

    dynasm!(ops
        ; jmp =>for_begin
        ; =>for_end
        ; mov eax, edx      // sync-activation count is the return value
        ; pop rbx
        ; ret
    );

    let buffer = ops.finalize().map_err(|_| FlipperError::Assemble)?;
    let kernel: extern "sysv64" fn() -> i32 =
        unsafe { std::mem::transmute(buffer.ptr(start)) };
    let sync_activations = kernel();
    Ok(sync_activations as u32)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::util::ROW_SIZE;

    fn params(order: &[u64], use_clflushopt: bool) -> BlacksmithParams<'_> {
        BlacksmithParams {
            hammer_order: order,
            num_aggs_for_sync: 2,
            total_num_activations: 2000,
            flushing: FlushPolicy::EarliestPossible,
            fencing: FencePolicy::LatestPossible,
            use_clflushopt,
        }
    }

    #[test]
    fn test_too_few_aggressors() {
        let mut buffer = vec![0u8; 4 * ROW_SIZE];
        let aggs: Vec<*mut u8> = (0..4)
            .map(|i| unsafe { buffer.as_mut_ptr().byte_add(i * ROW_SIZE) })
            .collect();
        let order = [1, 2, 3, 4];
        let err = hammer(&params(&order, false), &aggs).unwrap_err();
        assert!(matches!(
            err,
            FlipperError::TooFewAggressors { have: 4, need: 4 }
        ));
    }

    #[test]
    #[ignore = "executes the JIT kernel; requires unhindered rdtscp timing"]
    fn test_kernel_returns_sync_count() {
        let mut buffer = vec![0u8; 8 * ROW_SIZE];
        let aggs: Vec<*mut u8> = (0..8)
            .map(|i| unsafe { buffer.as_mut_ptr().byte_add(i * ROW_SIZE) })
            .collect();
        let order = [1, 2, 3, 4, 5, 6, 7, 8];
        let sync_activations = hammer(&params(&order, false), &aggs).unwrap();
        // both sync loops run at least once per outer iteration
        assert!(sync_activations >= 2);
    }

    #[test]
    fn test_latest_possible_policies_assemble() {
        let mut buffer = vec![0u8; 8 * ROW_SIZE];
        let aggs: Vec<*mut u8> = (0..8)
            .map(|i| unsafe { buffer.as_mut_ptr().byte_add(i * ROW_SIZE) })
            .collect();
        // repeated middle aggressors trigger the latest-possible branches
        let order = [1, 2, 3, 4, 3, 4, 7, 8];
        let p = BlacksmithParams {
            hammer_order: &order,
            num_aggs_for_sync: 2,
            total_num_activations: 1000,
            flushing: FlushPolicy::LatestPossible,
            fencing: FencePolicy::LatestPossible,
            use_clflushopt: false,
        };
        hammer(&p, &aggs).unwrap();
    }
}
