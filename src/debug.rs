//! C1: thin, typed operations over the kernel debug interface (spec.md §4.1).
//!
//! Every operation here talks to exactly one tid and fails with
//! `DynhookError::DebugIo` when the kernel rejects it, mirroring
//! `ptrace_util.h` in the original implementation. `nix::sys::ptrace` already
//! maps `ptrace(2)`'s `-1`/`errno` convention into a `Result`, so these are
//! thin wrappers rather than raw syscall plumbing.

use nix::sys::wait::{self, WaitStatus};
use nix::sys::{ptrace, signal};
use nix::unistd::Pid;

use crate::error::{DynhookError, Result};

pub type Word = u64;

pub fn peek(tid: Pid, addr: u64) -> Result<Word> {
    let v = ptrace::read(tid, addr as ptrace::AddressType)?;
    Ok(v as u64)
}

pub fn poke(tid: Pid, addr: u64, word: Word) -> Result<()> {
    ptrace::write(
        tid,
        addr as ptrace::AddressType,
        word as i64 as *mut libc::c_void,
    )?;
    Ok(())
}

pub fn get_regs(tid: Pid) -> Result<libc::user_regs_struct> {
    Ok(ptrace::getregs(tid)?)
}

pub fn set_regs(tid: Pid, regs: libc::user_regs_struct) -> Result<()> {
    Ok(ptrace::setregs(tid, regs)?)
}

pub fn attach(tid: Pid) -> Result<()> {
    Ok(ptrace::attach(tid)?)
}

/// `cont` with no pending signal.
pub fn cont(tid: Pid) -> Result<()> {
    ptrace::cont(tid, None)?;
    Ok(())
}

pub fn cont_with_signal(tid: Pid, sig: signal::Signal) -> Result<()> {
    ptrace::cont(tid, Some(sig))?;
    Ok(())
}

/// Send `SIGSTOP` to `tid`. A tid that has already exited (`ESRCH`) is
/// treated as success — it lost the race with its own death, not with us.
pub fn stop(tid: Pid) -> Result<()> {
    match signal::kill(tid, signal::Signal::SIGSTOP) {
        Ok(()) => Ok(()),
        Err(nix::Error::Sys(nix::errno::Errno::ESRCH)) => Ok(()),
        Err(e) => Err(DynhookError::from(e)),
    }
}

pub fn wait_for(tid: Pid) -> Result<WaitStatus> {
    Ok(wait::waitpid(Some(tid), Some(wait::WaitPidFlag::__WALL))?)
}

pub fn attach_and_wait(tid: Pid) -> Result<WaitStatus> {
    attach(tid)?;
    wait_for(tid)
}

pub fn cont_and_wait(tid: Pid) -> Result<WaitStatus> {
    cont(tid)?;
    wait_for(tid)
}
