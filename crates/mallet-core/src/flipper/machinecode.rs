//! Hand-emitted machine-code hammer kernel.
//!
//! The kernel is a flat function: prologue, `mov rbx, hammer_count`, one
//! access/NOP/flush block per aggressor, `mfence; dec rbx; jnz` back to the
//! first block, epilogue. The bytes are copied into a private anonymous RWX
//! mapping, executed once, and the mapping is released again.

use std::ptr::null_mut;

use super::FlipperError;

// ENDBR64; push rbp; mov rbp, rsp; push rbx; mov rbx, imm32
const FUNCTION_START: [u8; 12] = [
    0xf3, 0x0f, 0x1e, 0xfa, 0x55, 0x48, 0x89, 0xe5, 0x53, 0x48, 0xc7, 0xc3,
];

// movabs rax, imm64
const MOV_AGG_ADDR: [u8; 2] = [0x48, 0xb8];

// mov rcx, [rax]
const HAMMER_AGG: [u8; 3] = [0x48, 0x8b, 0x08];

const NOP: u8 = 0x90;

// clflush [rax]; lfence
const FLUSH_AGG: [u8; 6] = [0x0f, 0xae, 0x38, 0x0f, 0xae, 0xe8];

// clflushopt [rax]
const FLUSH_AGG_OPT: [u8; 4] = [0x66, 0x0f, 0xae, 0x38];

// mfence; dec rbx; jnz rel32
const FUNC_END_START: [u8; 8] = [0x0f, 0xae, 0xf0, 0x48, 0xff, 0xcb, 0x0f, 0x85];

// pop rbx; pop rbp; ret
const FUNC_END_END: [u8; 3] = [0x5b, 0x5d, 0xc3];

/// Emits the kernel for the given aggressor virtual addresses.
pub(crate) fn emit_kernel(
    aggs: &[u64],
    hammer_count: u64,
    nop_count: u64,
    use_clflushopt: bool,
) -> Vec<u8> {
    assert!(hammer_count <= u32::MAX as u64);

    let mut function = Vec::new();
    function.extend_from_slice(&FUNCTION_START);
    function.extend_from_slice(&(hammer_count as u32).to_le_bytes());
    let loop_start = function.len();

    for &agg in aggs {
        function.extend_from_slice(&MOV_AGG_ADDR);
        function.extend_from_slice(&agg.to_le_bytes());
        function.extend_from_slice(&HAMMER_AGG);
        function.extend(std::iter::repeat_n(NOP, nop_count as usize));
        if use_clflushopt {
            function.extend_from_slice(&FLUSH_AGG_OPT);
        } else {
            function.extend_from_slice(&FLUSH_AGG);
        }
    }

    function.extend_from_slice(&FUNC_END_START);
    // jump back over all aggressor blocks and the loop tail
    let jump_offset = loop_start as i64 - (function.len() as i64 + size_of::<i32>() as i64);
    function.extend_from_slice(&(jump_offset as i32).to_le_bytes());
    function.extend_from_slice(&FUNC_END_END);

    function
}

/// A private anonymous RWX mapping holding one generated function.
struct ExecutableRegion {
    mem: *mut u8,
    len: usize,
}

impl ExecutableRegion {
    fn new(code: &[u8]) -> Result<Self, FlipperError> {
        let mem = unsafe {
            libc::mmap(
                null_mut(),
                code.len(),
                libc::PROT_READ | libc::PROT_WRITE | libc::PROT_EXEC,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };
        if mem == libc::MAP_FAILED {
            return Err(FlipperError::JitMap(std::io::Error::last_os_error()));
        }
        let mem = mem as *mut u8;
        unsafe { std::ptr::copy_nonoverlapping(code.as_ptr(), mem, code.len()) };
        Ok(ExecutableRegion {
            mem,
            len: code.len(),
        })
    }

    fn call(&self) {
        let f: extern "C" fn() = unsafe { std::mem::transmute(self.mem) };
        f();
    }
}

impl Drop for ExecutableRegion {
    fn drop(&mut self) {
        unsafe { libc::munmap(self.mem as *mut libc::c_void, self.len) };
    }
}

/// Generates, runs and releases the machine-code kernel.
pub(crate) fn hammer(
    aggs: &[*mut u8],
    hammer_count: u64,
    nop_count: u64,
    use_clflushopt: bool,
) -> Result<(), FlipperError> {
    let addrs: Vec<u64> = aggs.iter().map(|&a| a as u64).collect();
    let code = emit_kernel(&addrs, hammer_count, nop_count, use_clflushopt);
    let region = ExecutableRegion::new(&code)?;
    region.call();
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::util::ROW_SIZE;

    fn count(haystack: &[u8], needle: &[u8]) -> usize {
        haystack.windows(needle.len()).filter(|w| *w == needle).count()
    }

    #[test]
    fn test_emitted_layout() {
        // two aggressors, no NOPs, one iteration, legacy flush
        let code = emit_kernel(&[0x1000, 0x2000], 1, 0, false);

        // exactly one `mov rbx, 1`
        assert_eq!(count(&code, &[0x48, 0xc7, 0xc3, 1, 0, 0, 0]), 1);
        // one access+flush block per aggressor
        assert_eq!(count(&code, &MOV_AGG_ADDR), 2);
        assert_eq!(count(&code, &HAMMER_AGG), 2);
        assert_eq!(count(&code, &[0x0f, 0xae, 0x38]), 2);
        // one loop tail and one return
        assert_eq!(count(&code, &[0x0f, 0xae, 0xf0]), 1); // mfence
        assert_eq!(count(&code, &[0x48, 0xff, 0xcb]), 1); // dec rbx
        assert_eq!(count(&code, &[0x0f, 0x85]), 1); // jnz
        assert!(code.ends_with(&FUNC_END_END));
    }

    #[test]
    fn test_jump_targets_first_block() {
        let code = emit_kernel(&[0x1000], 7, 3, false);
        let loop_start = FUNCTION_START.len() + 4;
        let jnz = count_prefix_until(&code, &[0x0f, 0x85]);
        let rel = i32::from_le_bytes(code[jnz + 2..jnz + 6].try_into().unwrap());
        assert_eq!((jnz as i64 + 6) + rel as i64, loop_start as i64);
    }

    fn count_prefix_until(haystack: &[u8], needle: &[u8]) -> usize {
        haystack
            .windows(needle.len())
            .position(|w| w == needle)
            .expect("needle not found")
    }

    #[test]
    fn test_nop_padding() {
        let with = emit_kernel(&[0x1000], 1, 80, false);
        let without = emit_kernel(&[0x1000], 1, 0, false);
        assert_eq!(with.len(), without.len() + 80);
        assert_eq!(count(&with, &[NOP; 80]), 1);
    }

    #[test]
    fn test_clflushopt_encoding() {
        let code = emit_kernel(&[0x1000], 1, 0, true);
        assert_eq!(count(&code, &FLUSH_AGG_OPT), 1);
        // no lfence in the clflushopt flavor
        assert_eq!(count(&code, &[0x0f, 0xae, 0xe8]), 0);
    }

    #[test]
    fn test_kernel_executes() {
        let mut row = vec![0x5au8; ROW_SIZE];
        let aggs = vec![row.as_mut_ptr(), unsafe {
            row.as_mut_ptr().byte_add(ROW_SIZE / 2)
        }];
        hammer(&aggs, 1000, 2, false).expect("kernel must run");
        // pure loads: the buffer is untouched
        assert!(row.iter().all(|&b| b == 0x5a));
    }
}
