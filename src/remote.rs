//! Remote memory access: a typed pointer into the target's address space,
//! and the byte-level read/write primitives built on top of C1.
//!
//! Grounded on `other_examples/.../reverie__src-remote.rs.rs`'s `RemotePtr`
//! and `Remote` trait, and on `traced_task.rs`'s `peek_bytes`/`poke_bytes`
//! (word-granular ptrace for small reads/writes, `process_vm_readv`/
//! `process_vm_writev` for anything larger — spec.md §4.1).

use nix::sys::uio;
use nix::unistd::Pid;
use std::marker::PhantomData;

use crate::consts::WORD_SIZE;
use crate::debug;
use crate::error::Result;

#[derive(Debug)]
pub struct RemotePtr<T> {
    addr: u64,
    _marker: PhantomData<T>,
}

impl<T> RemotePtr<T> {
    pub fn new(addr: u64) -> Self {
        RemotePtr {
            addr,
            _marker: PhantomData,
        }
    }

    pub fn addr(&self) -> u64 {
        self.addr
    }

    pub fn cast<U>(&self) -> RemotePtr<U> {
        RemotePtr::new(self.addr)
    }

    pub fn offset(&self, delta: i64) -> Self {
        RemotePtr::new((self.addr as i64 + delta) as u64)
    }
}

impl<T> Clone for RemotePtr<T> {
    fn clone(&self) -> Self {
        *self
    }
}
impl<T> Copy for RemotePtr<T> {}

/// Byte-granular read/write, plus the typed `peek`/`poke` convenience built
/// on them. Implementors only need to supply the tid-scoped byte ops; the
/// rest is free.
pub trait Remote {
    fn tid(&self) -> Pid;

    /// Read `size` bytes starting at `addr`. Reads below word granularity
    /// are satisfied by reading the enclosing word and truncating.
    fn peek_bytes(&self, addr: RemotePtr<u8>, size: usize) -> Result<Vec<u8>> {
        let tid = self.tid();
        if size <= WORD_SIZE {
            let word = debug::peek(tid, addr.addr())?;
            let bytes = word.to_le_bytes();
            Ok(bytes[..size].to_vec())
        } else {
            let mut buf = vec![0u8; size];
            let remote_iov = [uio::RemoteIoVec {
                base: addr.addr() as usize,
                len: size,
            }];
            let local_iov = [uio::IoVec::from_mut_slice(buf.as_mut_slice())];
            uio::process_vm_readv(tid, &local_iov, &remote_iov)?;
            Ok(buf)
        }
    }

    /// Write `bytes` starting at `addr`. Writes below word granularity are
    /// implemented by read-modify-write of the enclosing word (spec.md §4.1).
    fn poke_bytes(&self, addr: RemotePtr<u8>, bytes: &[u8]) -> Result<()> {
        let tid = self.tid();
        let size = bytes.len();
        if size <= WORD_SIZE {
            let mut word = if size < WORD_SIZE {
                debug::peek(tid, addr.addr())?
            } else {
                0
            };
            let mut word_bytes = word.to_le_bytes();
            word_bytes[..size].copy_from_slice(bytes);
            word = u64::from_le_bytes(word_bytes);
            debug::poke(tid, addr.addr(), word)
        } else {
            let remote_iov = [uio::RemoteIoVec {
                base: addr.addr() as usize,
                len: size,
            }];
            let local_iov = [uio::IoVec::from_slice(bytes)];
            uio::process_vm_writev(tid, &local_iov, &remote_iov)?;
            Ok(())
        }
    }

    fn peek(&self, addr: RemotePtr<u64>) -> Result<u64> {
        debug::peek(self.tid(), addr.addr())
    }

    fn poke(&self, addr: RemotePtr<u64>, value: u64) -> Result<()> {
        debug::poke(self.tid(), addr.addr(), value)
    }

    fn getregs(&self) -> Result<libc::user_regs_struct> {
        debug::get_regs(self.tid())
    }

    fn setregs(&self, regs: libc::user_regs_struct) -> Result<()> {
        debug::set_regs(self.tid(), regs)
    }
}
