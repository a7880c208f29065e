//! C2 (part 1): parse `/proc/<pid>/maps` into module descriptors
//! (spec.md §4.2). Parser grounded on the teacher's `src/proc.rs`, which
//! uses `combine` for the same job.

use std::fs::File;
use std::io::Read;
use std::path::PathBuf;

use combine::error::ParseError;
use combine::parser::char::{char, hex_digit, spaces};
use combine::Parser;
use combine::{choice, count, many1, none_of, optional, Stream};

use nix::unistd::Pid;

use crate::error::{DynhookError, Result};

/// One line of `/proc/<pid>/maps`, with the full field set (permissions,
/// device, inode, …) kept for diagnostics even though only a subset feeds
/// module enumeration.
#[derive(Clone)]
pub struct ProcMapsEntry {
    base: u64,
    size: u64,
    prot: i32,
    flags: i32,
    offset: u64,
    dev: i32,
    inode: u64,
    file: Option<PathBuf>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LinuxTaskState {
    Running,
    SleepInterruptible,
    SleepUninterruptible,
    Zombie,
    Stopped,
    Ptraced,
    Dead,
}

impl ProcMapsEntry {
    pub fn base(&self) -> u64 {
        self.base
    }
    pub fn size(&self) -> usize {
        self.size as usize
    }
    pub fn end(&self) -> u64 {
        self.base + self.size
    }
    pub fn is_executable(&self) -> bool {
        self.prot & libc::PROT_EXEC != 0
    }
    pub fn filename(&self) -> Option<&PathBuf> {
        self.file.as_ref()
    }
}

fn format_prot_flags(prot: i32, flags: i32) -> String {
    let mut res = String::new();
    res.push(if prot & libc::PROT_READ != 0 { 'r' } else { '-' });
    res.push(if prot & libc::PROT_WRITE != 0 { 'w' } else { '-' });
    res.push(if prot & libc::PROT_EXEC != 0 { 'x' } else { '-' });
    if flags & libc::MAP_SHARED != 0 {
        res.push('s');
    } else if flags & libc::MAP_PRIVATE != 0 {
        res.push('p');
    } else {
        res.push('-');
    }
    res
}

impl std::fmt::Debug for ProcMapsEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        let fp = self
            .file
            .as_ref()
            .map(|p| p.to_string_lossy().into_owned())
            .unwrap_or_default();
        write!(
            f,
            "{:x}-{:x} {} {:08x} {:02x}:{:02x} {:<10} {}",
            self.base,
            self.base + self.size,
            format_prot_flags(self.prot, self.flags),
            self.offset,
            self.dev.wrapping_shr(8),
            self.dev & 0xff,
            self.inode,
            fp
        )
    }
}

fn hex_value<I>() -> impl Parser<Input = I, Output = u64>
where
    I: Stream<Item = char>,
    I::Error: ParseError<I::Item, I::Range, I::Position>,
{
    many1::<String, _>(hex_digit()).map(|s| u64::from_str_radix(&s, 16).unwrap_or(0))
}

fn dev<I>() -> impl Parser<Input = I, Output = i32>
where
    I: Stream<Item = char>,
    I::Error: ParseError<I::Item, I::Range, I::Position>,
{
    (
        spaces(),
        count::<String, _>(2, hex_digit()),
        char(':'),
        count::<String, _>(2, hex_digit()),
    )
        .map(|(_, major, _, minor)| {
            i32::from_str_radix(&major, 16).unwrap_or(0) * 256
                + i32::from_str_radix(&minor, 16).unwrap_or(0)
        })
}

fn prot<I>() -> impl Parser<Input = I, Output = (i32, i32)>
where
    I: Stream<Item = char>,
    I::Error: ParseError<I::Item, I::Range, I::Position>,
{
    (
        spaces(),
        choice([char('-'), char('r')]),
        choice([char('-'), char('w')]),
        choice([char('-'), char('x')]),
        choice([char('-'), char('s'), char('p')]),
    )
        .map(|(_, r, w, x, p)| {
            let mut prot: i32 = 0;
            let mut flags: i32 = 0;
            if r == 'r' {
                prot |= libc::PROT_READ;
            }
            if w == 'w' {
                prot |= libc::PROT_WRITE;
            }
            if x == 'x' {
                prot |= libc::PROT_EXEC;
            }
            if p == 'p' {
                flags |= libc::MAP_PRIVATE;
            } else if p == 's' {
                flags |= libc::MAP_SHARED;
            }
            (prot, flags)
        })
}

fn filepath<I>() -> impl Parser<Input = I, Output = Option<PathBuf>>
where
    I: Stream<Item = char>,
    I::Error: ParseError<I::Item, I::Range, I::Position>,
{
    (
        spaces(),
        optional(many1::<String, _>(none_of("\r\n".chars()))),
    )
        .map(|(_, path)| path.map(PathBuf::from))
}

fn parser<I>() -> impl Parser<Input = I, Output = ProcMapsEntry>
where
    I: Stream<Item = char>,
    I::Error: ParseError<I::Item, I::Range, I::Position>,
{
    (
        hex_value(),
        char('-'),
        hex_value(),
        prot(),
        spaces(),
        hex_value(),
        dev(),
        spaces(),
        hex_value(),
        filepath(),
    )
        .map(
            |(from, _, to, (prot_val, flags_val), _, offset, devno, _, inode, path)| {
                ProcMapsEntry {
                    base: from,
                    size: to - from,
                    prot: prot_val,
                    flags: flags_val,
                    offset,
                    dev: devno,
                    inode,
                    file: path,
                }
            },
        )
}

fn parse_proc_maps_entry(line: &str) -> Result<ProcMapsEntry> {
    match parser().easy_parse(line) {
        Ok((result, _)) => Ok(result),
        Err(parse_error) => Err(DynhookError::Parse(format!(
            "cannot parse maps line {:?}: {}",
            line, parse_error
        ))),
    }
}

pub fn decode_proc_maps(pid: Pid) -> Result<Vec<ProcMapsEntry>> {
    let path = PathBuf::from("/proc").join(pid.to_string()).join("maps");
    let mut file = File::open(path)?;
    let mut contents = String::new();
    file.read_to_string(&mut contents)?;
    contents
        .lines()
        .filter(|line| !line.is_empty())
        .map(parse_proc_maps_entry)
        .collect()
}

/// Read a task's scheduling state out of `/proc/<pid>/status`. Kernel 3.13+
/// is assumed; older kernels have additional states we don't support.
pub fn proc_get_task_state(pid: Pid) -> Result<LinuxTaskState> {
    let path = PathBuf::from("/proc").join(pid.to_string()).join("status");
    let contents = std::fs::read_to_string(&path)?;
    contents
        .lines()
        .nth(2)
        .and_then(|s| match s.split_whitespace().nth(1) {
            Some("R") => Some(LinuxTaskState::Running),
            Some("S") => Some(LinuxTaskState::SleepInterruptible),
            Some("D") => Some(LinuxTaskState::SleepUninterruptible),
            Some("T") => Some(LinuxTaskState::Stopped),
            Some("t") => Some(LinuxTaskState::Ptraced),
            Some("X") => Some(LinuxTaskState::Dead),
            Some("Z") => Some(LinuxTaskState::Zombie),
            _ => None,
        })
        .ok_or_else(|| DynhookError::Parse(format!("could not read state from {:?}", path)))
}

/// List every tid currently in the target's task group, by listing
/// `/proc/<pid>/task`. Used by the task supervisor (spec.md §4.3).
pub fn snapshot_tasks(pid: Pid) -> Result<Vec<Pid>> {
    let path = PathBuf::from("/proc").join(pid.to_string()).join("task");
    let mut tids = Vec::new();
    for entry in std::fs::read_dir(&path)? {
        let entry = entry?;
        if let Some(name) = entry.file_name().to_str() {
            if let Ok(tid) = name.parse::<i32>() {
                tids.push(Pid::from_raw(tid));
            }
        }
    }
    Ok(tids)
}

#[cfg(test)]
mod tests {
    use super::*;
    use nix::unistd;

    #[test]
    fn can_decode_proc_self_maps() {
        let my_pid = unistd::getpid();
        let decoded = decode_proc_maps(my_pid).unwrap();
        assert!(!decoded.is_empty());
        assert!(decoded.iter().any(|e| e.is_executable()));
    }

    #[test]
    fn can_decode_proc_self_state() {
        let pid = unistd::getpid();
        assert!(proc_get_task_state(pid).is_ok());
    }

    #[test]
    fn can_snapshot_self_tasks() {
        let pid = unistd::getpid();
        let tasks = snapshot_tasks(pid).unwrap();
        assert!(tasks.contains(&pid));
    }
}
