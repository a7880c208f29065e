//! C6: remote allocator (spec.md §4.6). Two bump-allocator pools of
//! executable memory inside the target — one low, biased for 32-bit
//! displacement reachability, one high and unconstrained — each grown by
//! invoking a fresh `mem_map` stub via C5. Grounded on
//! `remote_allocator.h`/`.cc`.

use nix::unistd::Pid;

use crate::consts::{align8, DEFAULT_POOL_CAPACITY, HIGH_POOL_HINT, LOW_POOL_HINT};
use crate::error::{DynhookError, Result};
use crate::invoke::invoke_scratch;
use crate::process_info::ProcessInfo;
use crate::stubs::mem_map;

/// `{base, used, capacity, flag_set, address_hint}` — spec.md §3. `used`
/// never exceeds `capacity`; growth never moves existing allocations.
struct Pool {
    base: u64,
    used: usize,
    capacity: usize,
    flags: i32,
    hint: u64,
}

impl Pool {
    fn new(hint: u64, flags: i32) -> Self {
        Pool {
            base: 0,
            used: 0,
            capacity: 0,
            flags,
            hint,
        }
    }

    fn init(&mut self, proc: &ProcessInfo, tid: Pid) -> Result<()> {
        self.grow(proc, tid, 0)
    }

    fn allocate(&mut self, proc: &ProcessInfo, tid: Pid, size: usize) -> Result<u64> {
        let size = align8(size);
        if self.used + size > self.capacity {
            self.grow(proc, tid, size)?;
        }
        if self.used + size > self.capacity {
            return Err(DynhookError::AllocationFailed);
        }
        let addr = self.base + self.used as u64;
        self.used += size;
        Ok(addr)
    }

    /// Double the pool (or start at the default page size), mapping via a
    /// fresh `mem_map` stub. On the low pool, a `MAP_32BIT`-constrained
    /// mapping failure drops the flag and retries unconstrained (spec.md
    /// §4.6, resolving open question 2: a fresh stub is built for the
    /// retry, not a stale one).
    fn grow(&mut self, proc: &ProcessInfo, tid: Pid, guarantee: usize) -> Result<()> {
        let cap = if self.capacity == 0 {
            DEFAULT_POOL_CAPACITY
        } else {
            self.capacity * 2 + guarantee
        };

        let mut ret = self.try_map(proc, tid, cap)?;
        if ret == 0 && self.flags & libc::MAP_32BIT != 0 {
            self.flags &= !libc::MAP_32BIT;
            ret = self.try_map(proc, tid, cap)?;
        }

        if ret == 0 {
            return Err(DynhookError::AllocationFailed);
        }

        self.used = 0;
        self.capacity = cap;
        self.base = ret;
        Ok(())
    }

    fn try_map(&self, proc: &ProcessInfo, tid: Pid, cap: usize) -> Result<u64> {
        let stub = mem_map::create(proc, cap, self.hint, self.flags)?;
        invoke_scratch(tid, &stub, 0)
    }
}

/// Remote session-wide allocator: low pool biased at `0x400000` with
/// `MAP_32BIT`, high pool at `0x7f0000000000` unconstrained (spec.md §4.6).
pub struct RemoteAllocator {
    low: Pool,
    high: Pool,
}

impl RemoteAllocator {
    pub fn new() -> Self {
        RemoteAllocator {
            low: Pool::new(LOW_POOL_HINT, libc::MAP_ANONYMOUS | libc::MAP_PRIVATE | libc::MAP_32BIT),
            high: Pool::new(HIGH_POOL_HINT, libc::MAP_ANONYMOUS | libc::MAP_PRIVATE),
        }
    }

    /// Succeeds if *either* pool initializes (spec.md §4.6).
    pub fn init(&mut self, proc: &ProcessInfo, tid: Pid) -> Result<()> {
        let low_ok = self.low.init(proc, tid).is_ok();
        let high_ok = self.high.init(proc, tid).is_ok();
        if low_ok || high_ok {
            Ok(())
        } else {
            Err(DynhookError::AllocationFailed)
        }
    }

    /// A request with a hint below the high pool's hint address tries the
    /// low pool first and falls back to the high pool on failure;
    /// otherwise it goes straight to the high pool (spec.md §4.6, resolving
    /// open question 4: the low-pool success case returns immediately and
    /// does not fall through to the high pool).
    pub fn allocate(&mut self, proc: &ProcessInfo, tid: Pid, size: usize, hint: u64) -> Result<u64> {
        if hint < HIGH_POOL_HINT {
            match self.low.allocate(proc, tid, size) {
                Ok(addr) => Ok(addr),
                Err(_) => self.high.allocate(proc, tid, size),
            }
        } else {
            self.high.allocate(proc, tid, size)
        }
    }

    pub fn used(&self) -> usize {
        self.low.used + self.high.used
    }

    pub fn capacity(&self) -> usize {
        self.low.capacity + self.high.capacity
    }
}

impl Default for RemoteAllocator {
    fn default() -> Self {
        RemoteAllocator::new()
    }
}
