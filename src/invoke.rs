//! C5: remote invoker (spec.md §4.5). Runs a stub inside the target by
//! writing its bytes to a chosen address, hijacking one stopped thread's
//! register file, continuing to completion via the stub's terminating
//! `int3`, and reading back `RAX`. Grounded on the original's free
//! function `invoke(process_info*, const stub&, uintptr_t, uintptr_t*)` in
//! `stub.h` — notably that signature carries no destination address, so
//! the original always wrote the stub over scratch space rather than
//! allocator memory. `invoke_scratch` does the same here: stub bytes go
//! over the hijacked thread's own current instruction bytes (guaranteed
//! executable, and safe to clobber since the thread is Stopped there) and
//! are restored once the stub traps. This sidesteps the chicken-and-egg of
//! needing allocator memory before the allocator itself can be bootstrapped
//! (spec.md §4.6's pool `grow` uses `invoke_scratch` for exactly this
//! reason).

use nix::sys::wait::WaitStatus;
use nix::unistd::Pid;

use crate::debug;
use crate::error::{DynhookError, Result};
use crate::remote::{Remote, RemotePtr};
use crate::stubs::Stub;

/// Stack alignment the System V AMD64 ABI requires at a `call` instruction:
/// `rsp % 16 == 0` immediately before the `call`, i.e. `8` immediately
/// after entry — we hijack mid-function so we replicate the latter.
fn align_stack_for_call(rsp: u64) -> u64 {
    (rsp & !0xF) - 8
}

/// Run `stub` at a caller-chosen remote address. The bytes originally at
/// `addr` are saved and restored around the call, so this is safe whether
/// `addr` is allocator memory or scratch space already holding code.
pub fn invoke(tid: Pid, addr: u64, stub: &Stub, r9_arg: u64) -> Result<u64> {
    let target = TidTarget(tid);
    let saved_regs = debug::get_regs(tid)?;
    let saved_bytes = target.peek_bytes(RemotePtr::new(addr), stub.size())?;

    target.poke_bytes(RemotePtr::new(addr), stub.code())?;

    let mut regs = saved_regs;
    regs.rip = addr + stub.rip_offset() as u64;
    regs.r8 = addr;
    regs.r9 = r9_arg;
    regs.rsp = align_stack_for_call(saved_regs.rsp);
    debug::set_regs(tid, regs)?;

    let status = debug::cont_and_wait(tid)?;
    let trap_result = expect_trap(tid, status);

    let result_regs = debug::get_regs(tid)?;
    let result = result_regs.rax;

    target.poke_bytes(RemotePtr::new(addr), &saved_bytes)?;
    debug::set_regs(tid, saved_regs)?;

    trap_result?;
    Ok(result)
}

/// `invoke` with `addr` defaulted to `tid`'s current `RIP` — the common
/// case, used whenever the stub's own bytes don't need to persist (spec.md
/// §4.5 step 1: "a scratch location").
pub fn invoke_scratch(tid: Pid, stub: &Stub, r9_arg: u64) -> Result<u64> {
    let rip = debug::get_regs(tid)?.rip;
    invoke(tid, rip, stub, r9_arg)
}

fn expect_trap(tid: Pid, status: WaitStatus) -> Result<()> {
    match status {
        WaitStatus::Stopped(stopped_tid, nix::sys::signal::Signal::SIGTRAP) if stopped_tid == tid => {
            Ok(())
        }
        WaitStatus::Stopped(stopped_tid, sig) if stopped_tid == tid => Err(DynhookError::Parse(
            format!("stub did not stop on SIGTRAP, got {:?}", sig),
        )),
        other => Err(DynhookError::Parse(format!(
            "unexpected wait status while invoking stub: {:?}",
            other
        ))),
    }
}

struct TidTarget(Pid);

impl Remote for TidTarget {
    fn tid(&self) -> Pid {
        self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn alignment_leaves_8_mod_16() {
        let aligned = align_stack_for_call(0x7fff_ffff_fff0);
        assert_eq!(aligned % 16, 8);
    }
}
