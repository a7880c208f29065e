//! C4: stub compiler (spec.md §4.4). Builds position-independent x86-64
//! machine-code blobs for the four remote operations the engine needs:
//! `dlopen`+`dlsym` (load_symbol), `mmap` (mem_map), `munmap` (mem_unmap),
//! and `dlopen`+`dlsym`+call-with-r9 (set_patched_func). Grounded on
//! `stub.h`'s four classes; `stub.h`'s bodies were never retrieved (no
//! `stub.cc` in the pack), so the actual encoding here is built from the
//! calling-convention description in spec.md §4.4 using the encoders in
//! `asm.rs`.

use crate::asm::{self, CodeBuf, Reg};
use crate::error::Result;
use crate::process_info::ProcessInfo;

/// A stub's `(code, size, rip_offset)` contract (spec.md §6): every variant
/// is representable with the same three fields, so a single struct stands
/// in for the tagged variant/trait the design notes suggest.
pub struct Stub {
    code: Vec<u8>,
    rip_offset: usize,
}

impl Stub {
    pub fn code(&self) -> &[u8] {
        &self.code
    }

    pub fn size(&self) -> usize {
        self.code.len()
    }

    /// Offset of the first code byte from the start of `code()` — the
    /// invoker sets `RIP = base + rip_offset` to skip the data prefix.
    pub fn rip_offset(&self) -> usize {
        self.rip_offset
    }
}

fn cstr_bytes(s: &str) -> Vec<u8> {
    let mut v = s.as_bytes().to_vec();
    v.push(0);
    v
}

fn resolve(proc: &ProcessInfo, name: &str) -> Result<u64> {
    proc.find_symbol(name).map(|s| s.base)
}

/// `load_symbol::create` — dlopen `so`, dlsym `name`. Return convention
/// (spec.md §4.4): `1` = dlopen failed, `0` = dlsym failed, else resolved
/// address (dlsym's own return already encodes this).
pub mod load_symbol {
    use super::*;

    pub fn create(proc: &ProcessInfo, so: &str, name: &str) -> Result<Stub> {
        let dlopen_addr = resolve(proc, "dlopen")?;
        let dlsym_addr = resolve(proc, "dlsym")?;

        let mut data = cstr_bytes(so);
        let off_so: i32 = 0;
        let off_name: i32 = data.len() as i32;
        data.extend(cstr_bytes(name));
        let data_size = data.len();

        let mut buf = CodeBuf::new();
        asm::align_call(&mut buf);
        asm::lea_from_r8(&mut buf, Reg::Rdi, off_so);
        asm::mov_r32_imm32(&mut buf, Reg::Rsi, crate::consts::RTLD_NOW as u32);
        asm::movabs(&mut buf, Reg::Rax, dlopen_addr);
        asm::call_reg(&mut buf, Reg::Rax);
        asm::test_reg_reg(&mut buf, Reg::Rax);
        let fail_patch = asm::jz_rel32(&mut buf);
        asm::mov_reg_reg(&mut buf, Reg::Rdi, Reg::Rax);
        asm::lea_from_r8(&mut buf, Reg::Rsi, off_name);
        asm::movabs(&mut buf, Reg::Rax, dlsym_addr);
        asm::call_reg(&mut buf, Reg::Rax);
        let done_patch = asm::jmp_rel32(&mut buf);

        let fail_pos = buf.pos();
        asm::mov_r32_imm32(&mut buf, Reg::Rax, 1);

        let done_pos = buf.pos();
        asm::int3(&mut buf);

        buf.patch_rel32(fail_patch, fail_pos);
        buf.patch_rel32(done_patch, done_pos);

        let mut code = data;
        code.extend(buf.into_bytes());

        Ok(Stub {
            code,
            rip_offset: data_size,
        })
    }
}

/// `mem_map::create` — remote `mmap(NULL-or-hint, size, PROT_READ|WRITE|EXEC,
/// flags, -1, 0)`. Return convention: the mapped address, or the kernel's
/// falsy `MAP_FAILED`/`0` sentinel.
pub mod mem_map {
    use super::*;

    pub fn create(proc: &ProcessInfo, size: usize, addr_hint: u64, flags: i32) -> Result<Stub> {
        let mmap_addr = resolve(proc, "mmap")?;

        let mut buf = CodeBuf::new();
        // System V AMD64: rdi, rsi, rdx, rcx, r8, r9. We only have r8/r9
        // reserved by the invoker's calling convention (spec.md §4.4), so
        // this stub loads its own argument registers directly from
        // immediates rather than relying on r8/r9 for anything but the
        // mandatory rip-data-prefix/aux-argument slots (unused here).
        asm::align_call(&mut buf);
        encode_mmap_call(&mut buf, mmap_addr, addr_hint, size, flags);
        asm::int3(&mut buf);

        Ok(Stub {
            code: buf.into_bytes(),
            rip_offset: 0,
        })
    }
}

/// `mem_unmap::create` — remote `munmap(addr, size)`. Return convention:
/// the kernel's own return value (`0` success, `-1` on error).
pub mod mem_unmap {
    use super::*;

    pub fn create(proc: &ProcessInfo, addr: u64, size: usize) -> Result<Stub> {
        let munmap_addr = resolve(proc, "munmap")?;

        let mut buf = CodeBuf::new();
        asm::align_call(&mut buf);
        asm::movabs(&mut buf, Reg::Rdi, addr);
        asm::mov_r32_imm32(&mut buf, Reg::Rsi, size as u32);
        asm::movabs(&mut buf, Reg::Rax, munmap_addr);
        asm::call_reg(&mut buf, Reg::Rax);
        asm::int3(&mut buf);

        Ok(Stub {
            code: buf.into_bytes(),
            rip_offset: 0,
        })
    }
}

/// `set_patched_func::create` — dlopen `so`, dlsym `func`, call it with
/// `r9` (the trampoline pointer the invoker set up). Return convention:
/// `0` success, `1` dlopen failure, `2` dlsym failure.
pub mod set_patched_func {
    use super::*;

    pub fn create(proc: &ProcessInfo, so: &str, func: &str) -> Result<Stub> {
        let dlopen_addr = resolve(proc, "dlopen")?;
        let dlsym_addr = resolve(proc, "dlsym")?;

        let mut data = cstr_bytes(so);
        let off_so: i32 = 0;
        let off_func: i32 = data.len() as i32;
        data.extend(cstr_bytes(func));
        let data_size = data.len();

        let mut buf = CodeBuf::new();
        // Preserve r9 (the setter's argument) across the two libc calls by
        // pushing/popping it around dlopen/dlsym, since neither call is
        // guaranteed to leave caller-saved registers intact.
        push_r9(&mut buf);
        asm::lea_from_r8(&mut buf, Reg::Rdi, off_so);
        asm::mov_r32_imm32(&mut buf, Reg::Rsi, crate::consts::RTLD_NOW as u32);
        asm::movabs(&mut buf, Reg::Rax, dlopen_addr);
        asm::call_reg(&mut buf, Reg::Rax);
        asm::test_reg_reg(&mut buf, Reg::Rax);
        let fail_dlopen = asm::jz_rel32(&mut buf);
        asm::mov_reg_reg(&mut buf, Reg::Rdi, Reg::Rax);
        asm::lea_from_r8(&mut buf, Reg::Rsi, off_func);
        asm::movabs(&mut buf, Reg::Rax, dlsym_addr);
        asm::call_reg(&mut buf, Reg::Rax);
        asm::test_reg_reg(&mut buf, Reg::Rax);
        let fail_dlsym = asm::jz_rel32(&mut buf);

        // rax now holds the setter function pointer; restore the saved r9
        // into rdi (the setter's sole argument) and call it.
        pop_r9_into_rdi(&mut buf);
        asm::call_reg(&mut buf, Reg::Rax);
        asm::mov_r32_imm32(&mut buf, Reg::Rax, 0);
        let done = asm::jmp_rel32(&mut buf);

        let fail_dlopen_pos = buf.pos();
        pop_r9_discard(&mut buf);
        asm::mov_r32_imm32(&mut buf, Reg::Rax, 1);
        let skip_dlsym_fail = asm::jmp_rel32(&mut buf);

        let fail_dlsym_pos = buf.pos();
        pop_r9_discard(&mut buf);
        asm::mov_r32_imm32(&mut buf, Reg::Rax, 2);

        let done_pos = buf.pos();
        asm::int3(&mut buf);

        buf.patch_rel32(fail_dlopen, fail_dlopen_pos);
        buf.patch_rel32(fail_dlsym, fail_dlsym_pos);
        buf.patch_rel32(done, done_pos);
        buf.patch_rel32(skip_dlsym_fail, done_pos);

        let mut code = data;
        code.extend(buf.into_bytes());

        Ok(Stub {
            code,
            rip_offset: data_size,
        })
    }

    fn push_r9(buf: &mut CodeBuf) {
        buf.push(0x41); // REX.B
        buf.push(0x51); // push r9
    }

    fn pop_r9_into_rdi(buf: &mut CodeBuf) {
        buf.push(0x41);
        buf.push(0x59); // pop r9
        buf.push(0x4C);
        buf.push(0x89);
        buf.push(0xCF); // mov rdi, r9
    }

    fn pop_r9_discard(buf: &mut CodeBuf) {
        buf.push(0x41);
        buf.push(0x59); // pop r9 (value unused on failure paths)
    }
}

/// `mmap(addr_hint, size, PROT_READ|WRITE|EXEC, flags, -1, 0)` with the
/// six System V argument registers loaded from immediates.
fn encode_mmap_call(buf: &mut CodeBuf, mmap_addr: u64, addr_hint: u64, size: usize, flags: i32) {
    // mov rdi, addr_hint
    buf.push(0x48);
    buf.push(0xBF);
    buf.push_u64(addr_hint);
    // mov rsi, size
    buf.push(0x48);
    buf.push(0xBE);
    buf.push_u64(size as u64);
    // mov edx, PROT_READ|WRITE|EXEC
    buf.push(0xBA);
    buf.push_u32((libc::PROT_READ | libc::PROT_WRITE | libc::PROT_EXEC) as u32);
    // mov ecx, flags
    buf.push(0xB9);
    buf.push_u32(flags as u32);
    // mov r8, -1 (fd)
    buf.push(0x49);
    buf.push(0xB8);
    buf.push_u64(-1i64 as u64);
    // xor r9, r9 (offset = 0)
    buf.push(0x4D);
    buf.push(0x31);
    buf.push(0xC9);
    // movabs rax, mmap_addr; call rax
    asm::movabs(buf, Reg::Rax, mmap_addr);
    asm::call_reg(buf, Reg::Rax);
}
