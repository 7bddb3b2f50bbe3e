//! Structured output system for appctl.
//!
//! Provides verbosity-aware macros for all operator-facing output.
//! Initialize once from main() with `output::init(verbosity)`; when it was
//! never initialized (unit tests) the level is `Normal`.
//!
//! NOTE: Output from child processes spawned with Stdio::inherit()
//! (e.g., npm builds) bypasses this system and always appears on the
//! terminal. Remote script output is captured and echoed through
//! `o_detail!` instead.

use std::sync::OnceLock;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Verbosity {
    Quiet = 0,
    Normal = 1,
    Verbose = 2,
}

impl Verbosity {
    pub fn from_flags(quiet: bool, verbose: bool) -> Self {
        if quiet {
            Verbosity::Quiet
        } else if verbose {
            Verbosity::Verbose
        } else {
            Verbosity::Normal
        }
    }
}

static VERBOSITY: OnceLock<Verbosity> = OnceLock::new();

/// Initialize the global verbosity level. Later calls are ignored.
pub fn init(v: Verbosity) {
    let _ = VERBOSITY.set(v);
}

/// Get the current verbosity level.
pub fn verbosity() -> Verbosity {
    *VERBOSITY.get().unwrap_or(&Verbosity::Normal)
}

/// Print captured process output line by line, skipping blank lines.
pub fn print_lines(text: &str, prefix: &str) {
    for line in text.lines().filter(|l| !l.trim().is_empty()) {
        crate::o_detail!("{}{}", prefix, line);
    }
}

/// Major phase header. Shown at Normal+.
#[macro_export]
macro_rules! o_step {
    ($($arg:tt)*) => {
        if $crate::output::verbosity() >= $crate::output::Verbosity::Normal {
            println!($($arg)*);
        }
    };
}

/// Indented info/detail line. Shown at Normal+.
#[macro_export]
macro_rules! o_detail {
    ($($arg:tt)*) => {
        if $crate::output::verbosity() >= $crate::output::Verbosity::Normal {
            println!($($arg)*);
        }
    };
}

/// Completion/success indicator. Shown at Normal+.
#[macro_export]
macro_rules! o_success {
    ($($arg:tt)*) => {
        if $crate::output::verbosity() >= $crate::output::Verbosity::Normal {
            println!($($arg)*);
        }
    };
}

/// Non-fatal warning. Shown at Normal+.
#[macro_export]
macro_rules! o_warn {
    ($($arg:tt)*) => {
        if $crate::output::verbosity() >= $crate::output::Verbosity::Normal {
            eprintln!($($arg)*);
        }
    };
}

/// Fatal error. Always shown.
#[macro_export]
macro_rules! o_error {
    ($($arg:tt)*) => {
        eprintln!($($arg)*);
    };
}

/// Debug/verbose info. Shown at Verbose only.
#[macro_export]
macro_rules! o_debug {
    ($($arg:tt)*) => {
        if $crate::output::verbosity() >= $crate::output::Verbosity::Verbose {
            println!($($arg)*);
        }
    };
}

/// Interactive prompt. Always shown, uses print! (no newline).
#[macro_export]
macro_rules! o_print {
    ($($arg:tt)*) => {
        print!($($arg)*);
    };
}

/// Final result summary. Always shown (even in Quiet mode).
#[macro_export]
macro_rules! o_result {
    ($($arg:tt)*) => {
        println!($($arg)*);
    };
}
