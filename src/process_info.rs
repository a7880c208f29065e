//! C2 facade (spec.md §4.2, §6): `ProcessInfo::create` parses the target's
//! memory map into module descriptors, loads every module's function
//! symbols, and owns the C3 task supervisor for the same target. Grounded
//! on the original's `process_info.h`/`.cc`.

use std::io::Write;
use std::path::PathBuf;

use nix::unistd::Pid;

use crate::error::{DynhookError, Result};
use crate::proc::decode_proc_maps;
use crate::symbols::{load_symbols, SymbolInfo, SymbolTable};
use crate::tasks::TaskSupervisor;

/// `{start, end, path}` — spec.md §3. Distinct modules are keyed by path;
/// the first entry retained from the memory map is the main program.
#[derive(Clone, Debug)]
pub struct ModuleInfo {
    pub start: u64,
    pub end: u64,
    pub path: PathBuf,
}

pub struct ProcessInfo {
    pid: Pid,
    modules: Vec<ModuleInfo>,
    entry_path: PathBuf,
    symbols: SymbolTable,
    tasks: TaskSupervisor,
}

impl ProcessInfo {
    /// Performs spec.md §4.2: parse `/proc/<pid>/maps`, collapse duplicate
    /// `x` modules by path, and load every module's function symbols.
    pub fn create(pid: Pid) -> Result<ProcessInfo> {
        let entries = decode_proc_maps(pid)?;

        let mut modules: Vec<ModuleInfo> = Vec::new();
        let mut entry_path: Option<PathBuf> = None;

        for entry in &entries {
            if !entry.is_executable() {
                continue;
            }
            let path = match entry.filename() {
                Some(p) if p.is_absolute() => p.clone(),
                _ => continue,
            };
            if entry_path.is_none() {
                entry_path = Some(path.clone());
            }
            if modules.iter().any(|m| m.path == path) {
                continue;
            }
            modules.push(ModuleInfo {
                start: entry.base(),
                end: entry.end(),
                path,
            });
        }

        let entry_path = entry_path.ok_or_else(|| {
            DynhookError::Parse(format!("pid {} has no executable mapped module", pid))
        })?;

        let mut symbols = SymbolTable::new();
        for module in &modules {
            let is_main = module.path == entry_path;
            load_symbols(&module.path, module.start, is_main, &mut symbols)?;
        }

        Ok(ProcessInfo {
            pid,
            modules,
            entry_path,
            symbols,
            tasks: TaskSupervisor::new(),
        })
    }

    pub fn pid(&self) -> Pid {
        self.pid
    }

    pub fn path(&self) -> &PathBuf {
        &self.entry_path
    }

    pub fn modules(&self) -> &[ModuleInfo] {
        &self.modules
    }

    pub fn find_symbol(&self, name: &str) -> Result<&SymbolInfo> {
        self.symbols
            .find_by_name(name)
            .ok_or_else(|| DynhookError::SymbolNotFound(name.to_string()))
    }

    pub fn find_symbol_by_addr(&self, addr: u64) -> Option<&SymbolInfo> {
        self.symbols.find_by_addr(addr)
    }

    // --- C3 delegation (spec.md §4.3, §6) ---

    pub fn attach_all(&mut self) -> Result<()> {
        let pid = self.pid;
        self.tasks.attach_all(pid)
    }

    pub fn stop_all(&mut self) -> Result<()> {
        let pid = self.pid;
        self.tasks.stop_all(pid)
    }

    pub fn resume_all(&mut self) -> Result<()> {
        self.tasks.resume_all()
    }

    pub fn resume_and_wait(&mut self, tid: Pid) -> Result<()> {
        self.tasks.resume_and_wait(tid)
    }

    pub fn stop_thread(&mut self, tid: Pid) -> Result<()> {
        self.tasks.stop_thread(tid)
    }

    /// Any tid currently Stopped, for the remote invoker to hijack (spec.md
    /// §4.5) — the entry task is acceptable.
    pub fn any_stopped_tid(&self) -> Result<Pid> {
        self.tasks
            .any_stopped()
            .ok_or_else(|| DynhookError::DebugIo { errno: libc::ESRCH })
    }

    /// Debug pretty-printer used by `--debug` (spec.md SUPPLEMENTED
    /// FEATURES #2), mirroring `process_info::dump`.
    pub fn dump(&self, w: &mut dyn Write) -> std::io::Result<()> {
        writeln!(w, "Process path: {}", self.entry_path.display())?;
        writeln!(w, "Pid: {}", self.pid)?;
        writeln!(w, "Modules:")?;
        for m in &self.modules {
            writeln!(w, "  {:x}-{:x} {}", m.start, m.end, m.path.display())?;
        }
        writeln!(w, "Symbol Table")?;
        for s in self.symbols.iter() {
            writeln!(
                w,
                "Name:{} Weak:{} Base:{:x} Size:{}",
                s.name, s.weak, s.base, s.size
            )?;
        }
        Ok(())
    }
}

impl std::fmt::Display for ProcessInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "ProcessInfo(pid={}, path={})", self.pid, self.entry_path.display())
    }
}
