//! C7: detour patcher (spec.md §4.7). Builds a trampoline in the target
//! holding the displaced prologue, relocated to run from its new address,
//! then overwrites the target's entry with a 14-byte absolute jump to the
//! replacement. Grounded on the original's `patch.h` (`patch`/`patch_manager`),
//! with the external disassembler it depended on (`../instr/insn.h`, not in
//! the retrieved pack) replaced by `decoder.rs`.

use std::collections::HashSet;
use std::io::Write;

use nix::unistd::Pid;

use crate::asm::{self, JUMP_SEQUENCE_SIZE};
use crate::allocator::RemoteAllocator;
use crate::consts::LOW_POOL_HINT;
use crate::debug;
use crate::decoder::{self, BranchKind, DecodedInsn};
use crate::error::{DynhookError, Result};
use crate::process_info::ProcessInfo;
use crate::remote::{Remote, RemotePtr};
use crate::symbols::SymbolInfo;

/// Where a `Patch` sits in its lifecycle (spec.md §3).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PatchState {
    Created,
    Checked,
    Installed,
}

struct PidTarget(Pid);

impl Remote for PidTarget {
    fn tid(&self) -> Pid {
        self.0
    }
}

/// One patch record (spec.md §3, §4.7). Owned by a `PatchManager`; dropping
/// it with `body_modified` set restores the target's original bytes.
pub struct Patch {
    target: SymbolInfo,
    replacement_addr: u64,
    patch_len: usize,
    prologue: Vec<DecodedInsn>,
    saved_original_bytes: Vec<u8>,
    trampoline_addr: u64,
    trampoline_size: usize,
    patched_entry_addr: u64,
    body_modified: bool,
    state: PatchState,
    /// The tid `perform` wrote through. Stashed so `Drop` can restore
    /// original bytes without the caller having to remember to call
    /// `restore` (spec.md §7, §9 "Ownership and back-references").
    install_tid: Option<Pid>,
}

impl Patch {
    fn new(target: SymbolInfo, replacement_addr: u64) -> Self {
        Patch {
            target,
            replacement_addr,
            patch_len: 0,
            prologue: Vec::new(),
            saved_original_bytes: Vec::new(),
            trampoline_addr: 0,
            trampoline_size: 0,
            patched_entry_addr: 0,
            body_modified: false,
            state: PatchState::Created,
            install_tid: None,
        }
    }

    pub fn target(&self) -> &SymbolInfo {
        &self.target
    }

    pub fn new_function(&self) -> u64 {
        self.replacement_addr
    }

    pub fn state(&self) -> PatchState {
        self.state
    }

    pub fn patched_entry(&self) -> u64 {
        self.patched_entry_addr
    }

    /// spec.md §4.7 "Feasibility check". `tid` must already be Stopped.
    pub fn check(&mut self, tid: Pid) -> Result<()> {
        if (self.target.size as usize) < JUMP_SEQUENCE_SIZE {
            return Err(DynhookError::TargetTooSmall {
                have: self.target.size as usize,
                need: JUMP_SEQUENCE_SIZE,
            });
        }

        let target = PidTarget(tid);
        let body = target.peek_bytes(RemotePtr::new(self.target.base), self.target.size as usize)?;

        let mut prologue = Vec::new();
        let mut offset = 0usize;
        while offset < JUMP_SEQUENCE_SIZE {
            let window_end = (offset + 16).min(body.len());
            let mut window = body[offset..window_end].to_vec();
            window.resize(16, 0x90);
            let insn = decoder::decode_one(&window)?;
            if insn.length == 0 {
                return Err(DynhookError::Parse("zero-length instruction decoded".into()));
            }
            if insn.is_indirect_jump && offset == 0 {
                return Err(DynhookError::IndirectJump);
            }
            prologue.push(insn.clone());
            offset += insn.length;
        }

        if (self.target.size as usize) < offset {
            return Err(DynhookError::TargetTooSmall {
                have: self.target.size as usize,
                need: offset,
            });
        }

        // Branch-into check against the *final* patch length N (may exceed
        // JUMP_SEQUENCE_SIZE when the last decoded instruction overruns it,
        // e.g. five 3-byte instructions yield N=15): any relative branch in
        // the prologue landing in [target.base, target.base+N) can't be
        // faithfully preserved, since byte N-1 is still inside the region
        // the hook/trampoline relocation overwrites. Matches
        // `insn_jump_into_range(insn, start, end)` in the original, whose
        // `end` is this same variable bound, not a fixed constant.
        let region_start = self.target.base;
        let region_end = self.target.base + offset as u64;
        let mut src_offset = 0usize;
        for insn in &prologue {
            if let Some(target_addr) =
                insn.branch_target(self.target.base + src_offset as u64, &body[src_offset..])
            {
                if target_addr >= region_start && target_addr < region_end {
                    return Err(DynhookError::UnrelocatableJumpInto);
                }
            }
            src_offset += insn.length;
        }

        self.patch_len = offset;
        self.prologue = prologue;
        self.state = PatchState::Checked;
        Ok(())
    }

    /// spec.md §4.7 "Installation". Requires `check` to have run; all tids
    /// in the target must be Stopped.
    pub fn perform(&mut self, alloc: &mut RemoteAllocator, proc: &ProcessInfo, tid: Pid) -> Result<u64> {
        if self.state != PatchState::Checked {
            return Err(DynhookError::Parse("perform called before check".into()));
        }

        let target = PidTarget(tid);
        let body = target.peek_bytes(RemotePtr::new(self.target.base), self.patch_len)?;

        // Widening (short jcc/jmp -> near) is determined entirely by opcode,
        // not by address, so the trampoline's size is known before its
        // address is. Allocate first, stash the address, then relocate with
        // real displacements in one pass.
        self.trampoline_size = self.relocated_size() + JUMP_SEQUENCE_SIZE;
        let trampoline_addr = alloc.allocate(proc, tid, self.trampoline_size, LOW_POOL_HINT)?;
        self.trampoline_addr = trampoline_addr;

        let trampoline_bytes = self.copy_detour(&body)?;
        target.poke_bytes(RemotePtr::new(trampoline_addr), &trampoline_bytes)?;

        let mut hook = asm::absolute_jump(self.replacement_addr).to_vec();
        hook.resize(self.patch_len, 0x90);

        self.saved_original_bytes = body;
        target.poke_bytes(RemotePtr::new(self.target.base), &hook)?;
        self.body_modified = true;
        self.install_tid = Some(tid);

        self.patched_entry_addr = trampoline_addr;
        self.state = PatchState::Installed;
        Ok(self.patched_entry_addr)
    }

    /// Relocate the checked prologue into a trampoline buffer ending with an
    /// absolute jump back to the continuation (spec.md §4.7 `copy_detour`).
    fn copy_detour(&self, body: &[u8]) -> Result<Vec<u8>> {
        let mut out = Vec::new();
        let mut src_offset = 0usize;

        for insn in &self.prologue {
            let src_addr = self.target.base + src_offset as u64;
            let raw = &body[src_offset..src_offset + insn.length];

            match insn.branch_kind {
                None => out.extend_from_slice(raw),
                Some(BranchKind::LoopFamily) => {
                    let old_target = insn
                        .branch_target(src_addr, raw)
                        .ok_or_else(|| DynhookError::Parse("loop-family insn missing displacement".into()))?;
                    let dest_addr = self.trampoline_entry_addr() + out.len() as u64;
                    let new_disp = old_target as i64 - (dest_addr + insn.length as i64);
                    if !(i8::MIN as i64..=i8::MAX as i64).contains(&new_disp) {
                        return Err(DynhookError::UnrelocatableJumpInto);
                    }
                    let mut relocated = raw.to_vec();
                    relocated[insn.disp_offset.unwrap()] = new_disp as i8 as u8;
                    out.extend_from_slice(&relocated);
                }
                Some(kind @ (BranchKind::JccShort | BranchKind::JmpShort)) => {
                    let old_target = insn
                        .branch_target(src_addr, raw)
                        .ok_or_else(|| DynhookError::Parse("short branch missing displacement".into()))?;
                    let dest_addr = self.trampoline_entry_addr() + out.len() as u64;
                    let widened_len = if kind == BranchKind::JccShort { 6 } else { 5 };
                    let new_disp = (old_target as i64 - (dest_addr + widened_len as i64)) as i32;
                    if kind == BranchKind::JccShort {
                        out.push(0x0F);
                        out.push(0x80 | (raw[0] & 0x0F));
                    } else {
                        out.push(0xE9);
                    }
                    out.extend_from_slice(&new_disp.to_le_bytes());
                }
                Some(BranchKind::JmpNear) | Some(BranchKind::CallNear) | Some(BranchKind::JccNear) => {
                    let old_target = insn
                        .branch_target(src_addr, raw)
                        .ok_or_else(|| DynhookError::Parse("near branch missing displacement".into()))?;
                    let dest_addr = self.trampoline_entry_addr() + out.len() as u64;
                    let disp_offset = insn.disp_offset.unwrap();
                    let new_disp = (old_target as i64 - (dest_addr + insn.length as i64)) as i32;
                    let mut relocated = raw.to_vec();
                    relocated[disp_offset..disp_offset + 4].copy_from_slice(&new_disp.to_le_bytes());
                    out.extend_from_slice(&relocated);
                }
            }

            if let Some(rip_off) = insn.rip_disp_offset {
                let dest_addr = self.trampoline_entry_addr() + out.len() as u64 - insn.length as u64;
                let old_disp = i32::from_le_bytes([
                    raw[rip_off],
                    raw[rip_off + 1],
                    raw[rip_off + 2],
                    raw[rip_off + 3],
                ]);
                let old_target = (src_addr as i64 + insn.length as i64 + old_disp as i64) as u64;
                let new_disp = (old_target as i64 - (dest_addr + insn.length as i64)) as i32;
                let start = out.len() - (insn.length - rip_off - 4) - 4;
                out[start..start + 4].copy_from_slice(&new_disp.to_le_bytes());
            }

            src_offset += insn.length;
        }

        let continuation = self.target.base + self.patch_len as u64;
        out.extend_from_slice(&asm::absolute_jump(continuation));
        Ok(out)
    }

    /// Trampoline address to relocate displacements against. `perform` sets
    /// `trampoline_addr` before calling `copy_detour`.
    fn trampoline_entry_addr(&self) -> u64 {
        self.trampoline_addr
    }

    /// Sum of each prologue instruction's relocated length — short
    /// conditional/unconditional branches widen to their near forms (6/5
    /// bytes), everything else keeps its original length. Address-independent,
    /// so this can be computed before the trampoline is allocated.
    fn relocated_size(&self) -> usize {
        self.prologue
            .iter()
            .map(|insn| match insn.branch_kind {
                Some(BranchKind::JccShort) => 6,
                Some(BranchKind::JmpShort) => 5,
                _ => insn.length,
            })
            .sum()
    }

    pub fn dump(&self, w: &mut dyn Write) -> std::io::Result<()> {
        writeln!(w, "Patch target: {} @ {:#x}", self.target.name, self.target.base)?;
        writeln!(w, "Replacement: {:#x}", self.replacement_addr)?;
        writeln!(w, "State: {:?}", self.state)?;
        writeln!(w, "Patch length: {}", self.patch_len)?;
        writeln!(w, "Trampoline: {:#x} ({} bytes)", self.trampoline_addr, self.trampoline_size)?;
        Ok(())
    }

    /// spec.md §7: teardown restores original bytes best-effort. Called both
    /// explicitly and from `Drop`.
    fn teardown(&mut self, tid: Pid) {
        if !self.body_modified {
            return;
        }
        let target = PidTarget(tid);
        let _ = target.poke_bytes(RemotePtr::new(self.target.base), &self.saved_original_bytes);
        self.body_modified = false;
    }

    /// Explicit teardown a caller can check the result of, distinct from the
    /// best-effort `Drop` path.
    pub fn restore(&mut self, tid: Pid) -> Result<()> {
        if !self.body_modified {
            return Ok(());
        }
        let target = PidTarget(tid);
        target.poke_bytes(RemotePtr::new(self.target.base), &self.saved_original_bytes)?;
        self.body_modified = false;
        self.install_tid = None;
        Ok(())
    }
}

/// Best-effort teardown on destruction (spec.md §3 "Lifecycles", §7): a
/// `Patch` dropped with `body_modified` still set writes its saved original
/// bytes back through whichever tid `perform` last used. Mirrors the
/// original's destructor-driven restore in `patch.h`; failures are swallowed
/// since a drop can't propagate `Result` and the target may already be gone
/// (process death, detach) by the time this runs.
impl Drop for Patch {
    fn drop(&mut self) {
        if let Some(tid) = self.install_tid {
            self.teardown(tid);
        }
    }
}

/// Tracks which symbol names have already been patched in this session, so a
/// target cannot be hooked twice (spec.md §4.7, `patch_manager::m_patch_list`).
#[derive(Default)]
pub struct PatchManager {
    patched: HashSet<String>,
}

impl PatchManager {
    pub fn new() -> Self {
        PatchManager::default()
    }

    pub fn create_patch(
        &mut self,
        proc: &ProcessInfo,
        target_name: &str,
        replacement_addr: u64,
    ) -> Result<Patch> {
        if self.patched.contains(target_name) {
            return Err(DynhookError::DuplicatePatch(target_name.to_string()));
        }
        let target = proc.find_symbol(target_name)?.clone();
        self.patched.insert(target_name.to_string());
        Ok(Patch::new(target, replacement_addr))
    }

    pub fn len(&self) -> usize {
        self.patched.len()
    }

    pub fn is_empty(&self) -> bool {
        self.patched.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sym(name: &str, base: u64, size: u64) -> SymbolInfo {
        SymbolInfo {
            name: name.to_string(),
            base,
            size,
            weak: false,
        }
    }

    #[test]
    fn duplicate_patch_name_rejected() {
        let mut mgr = PatchManager::new();
        mgr.patched.insert("stub".to_string());
        assert!(mgr.patched.contains("stub"));
    }

    #[test]
    fn patch_starts_in_created_state() {
        let p = Patch::new(sym("stub", 0x1000, 0x40), 0x2000);
        assert_eq!(p.state(), PatchState::Created);
        assert_eq!(p.target().name, "stub");
    }

    #[test]
    fn copy_detour_appends_absolute_jump_tail() {
        let mut p = Patch::new(sym("stub", 0x1000, 0x40), 0x2000);
        // push rbp; mov rbp,rsp; sub rsp,0x20; nop*... up to 14 bytes.
        let body: Vec<u8> = vec![
            0x55, 0x48, 0x89, 0xe5, 0x48, 0x83, 0xec, 0x20, 0x90, 0x90, 0x90, 0x90, 0x90, 0x90,
        ];
        p.prologue = vec![
            decoder::decode_one(&[body[0], 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0]).unwrap(),
            decoder::decode_one(&body[1..]).unwrap(),
            decoder::decode_one(&body[4..]).unwrap(),
        ];
        let consumed: usize = p.prologue.iter().map(|i| i.length).sum();
        p.patch_len = consumed.max(JUMP_SEQUENCE_SIZE);
        p.trampoline_addr = 0x5000;
        let out = p.copy_detour(&body[..consumed]).unwrap();
        assert_eq!(&out[out.len() - JUMP_SEQUENCE_SIZE..][0..1], &[0x68]);
    }

    #[test]
    fn restore_noop_without_body_modified() {
        let mut p = Patch::new(sym("stub", 0x1000, 0x40), 0x2000);
        assert!(!p.body_modified);
        // restore() against a bogus tid must not attempt any ptrace call
        // when nothing was ever written.
        let result = p.restore(Pid::from_raw(1));
        assert!(result.is_ok());
    }
}
