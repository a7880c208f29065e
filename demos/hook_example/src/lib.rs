//! Replacement library for a hooked `fn(i32)` target. Loaded into the
//! target process by the engine's `load_symbol`/`set_patched_func` stubs,
//! never linked against `dynhook` itself.

use std::sync::atomic::{AtomicUsize, Ordering};

/// Holds the trampoline pointer to the original function, set once by
/// `set_original` after the patch is installed.
static ORIGINAL: AtomicUsize = AtomicUsize::new(0);

/// Replacement for the hooked function: prints a banner, then falls through
/// to the original via the trampoline so the target's own behavior (and
/// side effects) continue unchanged.
#[no_mangle]
pub extern "C" fn hooked_function(arg: i32) {
    println!("Hooked!");
    println!("Hello From Hooked Function");
    println!("See:{}", arg);

    let original = ORIGINAL.load(Ordering::SeqCst);
    if original != 0 {
        let f: extern "C" fn(i32) = unsafe { std::mem::transmute(original) };
        f(arg);
    }
}

/// Setter invoked once by the engine with the trampoline address in its
/// sole argument.
#[no_mangle]
pub extern "C" fn set_original(trampoline: usize) {
    ORIGINAL.store(trampoline, Ordering::SeqCst);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_to_no_original() {
        assert_eq!(ORIGINAL.load(Ordering::SeqCst), 0);
    }
}
