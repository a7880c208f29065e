//! `dynhook` CLI (spec.md §6, SUPPLEMENTED FEATURES #1/#2). Parses
//! `--pid`/`--hook`/`--debug`/`--wait-for-keypress`, then drives the engine
//! through the exact orchestration order of the original `dynhook.cc`'s
//! `main()`: create `ProcessInfo` -> optional dump -> `attach_all` ->
//! `RemoteAllocator::init` -> per-hook `load_symbol` stub + invoke + patch
//! creation + check -> per-patch `perform` + `set_patched_func` stub +
//! invoke -> optional dump -> `resume_all` -> wait for keypress -> `stop_all`.

use std::io::Read as _;

use clap::{App, Arg};
use log::{debug, error, info};
use nix::unistd::Pid;

use dynhook::allocator::RemoteAllocator;
use dynhook::error::{DynhookError, Result};
use dynhook::invoke::invoke_scratch;
use dynhook::patch::PatchManager;
use dynhook::process_info::ProcessInfo;
use dynhook::stubs::{load_symbol, set_patched_func};

/// One parsed `--hook path@target:hook:entry` argument (spec.md
/// SUPPLEMENTED FEATURES #1, `dynhook.cc`'s `parse_hook`).
struct HookSpec {
    path: String,
    target: String,
    hook: String,
    entry: String,
}

fn parse_hook(raw: &str) -> Result<HookSpec> {
    let (path, rest) = raw
        .split_once('@')
        .ok_or_else(|| DynhookError::Parse(format!("hook spec {:?} missing '@'", raw)))?;
    let (target, rest) = rest
        .split_once(':')
        .ok_or_else(|| DynhookError::Parse(format!("hook spec {:?} missing first ':'", raw)))?;
    let (hook, entry) = rest
        .split_once(':')
        .ok_or_else(|| DynhookError::Parse(format!("hook spec {:?} missing second ':'", raw)))?;

    Ok(HookSpec {
        path: path.to_string(),
        target: target.to_string(),
        hook: hook.to_string(),
        entry: entry.to_string(),
    })
}

fn run(pid: Pid, hooks: Vec<HookSpec>, debug_mode: bool, wait_for_keypress: bool) -> Result<()> {
    let mut proc = ProcessInfo::create(pid)?;

    if debug_mode {
        let mut stdout = std::io::stdout();
        proc.dump(&mut stdout).ok();
    }

    proc.attach_all()?;
    let tid = proc.any_stopped_tid()?;

    let mut alloc = RemoteAllocator::new();
    alloc.init(&proc, tid)?;

    let mut mgr = PatchManager::new();
    let mut patches = Vec::new();

    for hk in &hooks {
        let ls_stub = load_symbol::create(&proc, &hk.path, &hk.hook)?;
        let new_function = invoke_scratch(tid, &ls_stub, 0)?;
        if new_function == 0 {
            error!("cannot load function {} from {}", hk.hook, hk.path);
            return Err(DynhookError::SymbolNotFound(hk.hook.clone()));
        }

        let mut patch = mgr.create_patch(&proc, &hk.target, new_function)?;
        patch.check(tid)?;
        patches.push(patch);
    }

    for (patch, hk) in patches.iter_mut().zip(hooks.iter()) {
        let trampoline = patch.perform(&mut alloc, &proc, tid)?;

        let setter_stub = set_patched_func::create(&proc, &hk.path, &hk.entry)?;
        let ret = invoke_scratch(tid, &setter_stub, trampoline)?;
        if ret != 0 {
            error!(
                "invoking setter {} in {} failed with code {}",
                hk.entry, hk.path, ret
            );
            return Err(DynhookError::StubFailure { code: ret as i64 });
        }

        info!("patched {} -> entry at {:#x}", hk.target, trampoline);
    }

    if debug_mode {
        let mut stdout = std::io::stdout();
        for patch in &patches {
            patch.dump(&mut stdout).ok();
        }
    }

    proc.resume_all()?;

    if wait_for_keypress {
        println!("Press any key to exit the process!");
        let mut buf = [0u8; 1];
        let _ = std::io::stdin().read(&mut buf);
    }

    proc.stop_all()?;
    Ok(())
}

fn main() {
    let matches = App::new("dynhook")
        .about("Live function hooking on a running Linux x86-64 process")
        .arg(
            Arg::with_name("pid")
                .long("pid")
                .takes_value(true)
                .required(true)
                .help("Target process id"),
        )
        .arg(
            Arg::with_name("hook")
                .long("hook")
                .takes_value(true)
                .multiple(true)
                .number_of_values(1)
                .help("Hook spec: path@target:hook:entry"),
        )
        .arg(Arg::with_name("debug").long("debug").help("Verbose debug output"))
        .arg(
            Arg::with_name("no-wait-for-keypress")
                .long("no-wait-for-keypress")
                .help("Tear down immediately instead of waiting for a keypress (default: wait)"),
        )
        .get_matches();

    let debug_mode = matches.is_present("debug");
    dynhook::logging::init(debug_mode);

    let pid_raw = matches.value_of("pid").unwrap();
    let pid: i32 = match pid_raw.parse() {
        Ok(p) => p,
        Err(e) => {
            eprintln!("pid value invalid: {}", e);
            std::process::exit(1);
        }
    };

    let hook_specs: Vec<&str> = matches.values_of("hook").map(|v| v.collect()).unwrap_or_default();
    let mut hooks = Vec::with_capacity(hook_specs.len());
    for raw in hook_specs {
        match parse_hook(raw) {
            Ok(h) => {
                debug!("hook option: {}@{}:{}:{}", h.path, h.target, h.hook, h.entry);
                hooks.push(h);
            }
            Err(e) => {
                eprintln!("{}", e);
                std::process::exit(1);
            }
        }
    }

    let wait_for_keypress = !matches.is_present("no-wait-for-keypress");

    if let Err(e) = run(Pid::from_raw(pid), hooks, debug_mode, wait_for_keypress) {
        error!("{}", e);
        eprintln!("{}", e);
        std::process::exit(1);
    }
}
