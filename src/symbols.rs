//! C2 (part 2): symbol extraction from a module's object file (spec.md
//! §4.2), reimplemented against `goblin` (the ELF walk in the original's
//! `process_info.cc` used `libelf` directly; `goblin` is the ecosystem
//! equivalent already in the teacher's `Cargo.toml`).

use std::collections::HashMap;
use std::fs;
use std::path::Path;

use goblin::elf::{sym::Sym, Elf};

use crate::error::Result;

/// `{name, base, size, weak}` — spec.md §3.
#[derive(Clone, Debug)]
pub struct SymbolInfo {
    pub name: String,
    pub base: u64,
    pub size: u64,
    pub weak: bool,
}

/// Address-sorted symbol table plus a name index, mirroring the original's
/// `m_symbol_info` vector + `m_symbol_name_index` multimap (process_info.h).
#[derive(Default)]
pub struct SymbolTable {
    by_addr: Vec<SymbolInfo>,
    by_name: HashMap<String, Vec<SymbolInfo>>,
}

impl SymbolTable {
    pub fn new() -> Self {
        SymbolTable::default()
    }

    /// Insert keeping `by_addr` sorted, as the original's
    /// `push_symbol_info` does via `std::lower_bound`.
    pub fn push(&mut self, info: SymbolInfo) {
        let pos = self
            .by_addr
            .binary_search_by(|s| s.base.cmp(&info.base))
            .unwrap_or_else(|i| i);
        self.by_name
            .entry(info.name.clone())
            .or_insert_with(Vec::new)
            .push(info.clone());
        self.by_addr.insert(pos, info);
    }

    /// `find_by_name` — a strong homonym wins over a weak one (spec.md §4.2).
    pub fn find_by_name(&self, name: &str) -> Option<&SymbolInfo> {
        let candidates = self.by_name.get(name)?;
        candidates
            .iter()
            .find(|s| !s.weak)
            .or_else(|| candidates.first())
    }

    /// `find_by_addr` — lower-bound lookup over the range the symbol covers.
    pub fn find_by_addr(&self, addr: u64) -> Option<&SymbolInfo> {
        let pos = match self.by_addr.binary_search_by(|s| s.base.cmp(&addr)) {
            Ok(i) => return Some(&self.by_addr[i]),
            Err(i) => i,
        };
        if pos == 0 {
            return None;
        }
        let candidate = &self.by_addr[pos - 1];
        if addr >= candidate.base && addr <= candidate.base + candidate.size {
            Some(candidate)
        } else {
            None
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = &SymbolInfo> {
        self.by_addr.iter()
    }
}

fn keep_sym(sym: &Sym) -> bool {
    sym.st_value != 0
        && sym.is_function()
        && (sym.st_bind() == goblin::elf::sym::STB_GLOBAL
            || sym.st_bind() == goblin::elf::sym::STB_WEAK)
}

/// Load every function symbol from one module's object file into `table`.
///
/// For the main program both the static and dynamic symbol tables are
/// consumed (two sections, matching `load_symbol_info`'s `do { .. } while
/// (is_entry && cnt < 2)` loop); for every other module only the dynamic
/// table is read.
pub fn load_symbols(path: &Path, load_base: u64, is_main: bool, table: &mut SymbolTable) -> Result<()> {
    let data = fs::read(path)?;
    let elf = Elf::parse(&data)?;
    let offset = if is_main { 0 } else { load_base };

    load_from_symtab(&elf.dynsyms, &elf.dynstrtab, offset, table);
    if is_main {
        load_from_symtab(&elf.syms, &elf.strtab, offset, table);
    }
    Ok(())
}

fn load_from_symtab(
    syms: &goblin::elf::sym::Symtab,
    strtab: &goblin::strtab::Strtab,
    offset: u64,
    table: &mut SymbolTable,
) {
    for sym in syms.iter() {
        if !keep_sym(&sym) {
            continue;
        }
        let name = match strtab.get(sym.st_name) {
            Some(Ok(n)) if !n.is_empty() => n.to_string(),
            _ => continue,
        };
        table.push(SymbolInfo {
            name,
            base: sym.st_value + offset,
            size: sym.st_size,
            weak: sym.st_bind() == goblin::elf::sym::STB_WEAK,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sym(name: &str, base: u64, size: u64, weak: bool) -> SymbolInfo {
        SymbolInfo {
            name: name.to_string(),
            base,
            size,
            weak,
        }
    }

    #[test]
    fn find_by_addr_covers_range() {
        let mut t = SymbolTable::new();
        t.push(sym("a", 0x1000, 0x10, false));
        t.push(sym("b", 0x2000, 0x20, false));
        assert_eq!(t.find_by_addr(0x1005).unwrap().name, "a");
        assert_eq!(t.find_by_addr(0x2020).unwrap().name, "b");
        assert!(t.find_by_addr(0x1020).is_none());
    }

    #[test]
    fn strong_symbol_wins_over_weak() {
        let mut t = SymbolTable::new();
        t.push(sym("malloc", 0x3000, 0x8, true));
        t.push(sym("malloc", 0x3000, 0x8, false));
        let found = t.find_by_name("malloc").unwrap();
        assert!(!found.weak);
    }

    #[test]
    fn weak_symbol_used_when_no_strong_present() {
        let mut t = SymbolTable::new();
        t.push(sym("free", 0x4000, 0x8, true));
        assert!(t.find_by_name("free").unwrap().weak);
    }
}
