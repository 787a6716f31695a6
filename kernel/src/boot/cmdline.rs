//! Kernel command line
//!
//! Options are space-separated `key=value` pairs; values may be quoted
//! with `"..."`. Keys are an open set: module-enable toggles look like
//! `name=0`, so any unknown key is still retrievable by whoever owns it.

#[cfg(feature = "alloc")]
extern crate alloc;

#[cfg(feature = "alloc")]
use alloc::string::{String, ToString};

use spin::Once;

static COMMAND_LINE: Once<String> = Once::new();

/// Stash the command line. Later calls are ignored.
#[cfg(feature = "alloc")]
pub fn init(cmdline: &str) {
    COMMAND_LINE.call_once(|| cmdline.to_string());
}

fn command_line() -> &'static str {
    COMMAND_LINE.get().map(String::as_str).unwrap_or("")
}

/// Find the raw value substring for `key`, honoring quoting.
fn find_value(key: &str) -> Option<&'static str> {
    let line = command_line();
    let mut search = line;
    let mut base = 0usize;
    while let Some(pos) = search.find(key) {
        let absolute = base + pos;
        // Must start the option (beginning of line or after a space) and
        // be followed by '='.
        let starts_option = absolute == 0 || line.as_bytes()[absolute - 1] == b' ';
        let after_key = absolute + key.len();
        if starts_option && line.as_bytes().get(after_key) == Some(&b'=') {
            let rest = &line[after_key + 1..];
            let value = if let Some(stripped) = rest.strip_prefix('"') {
                match stripped.find('"') {
                    Some(end) => &stripped[..end],
                    None => stripped,
                }
            } else {
                match rest.find(' ') {
                    Some(end) => &rest[..end],
                    None => rest,
                }
            };
            return Some(value);
        }
        base = absolute + 1;
        search = &line[base..];
    }
    None
}

/// String option, or `fallback` if the key is absent.
#[cfg(feature = "alloc")]
pub fn get_str(key: &str, fallback: &str) -> String {
    find_value(key).unwrap_or(fallback).to_string()
}

/// Unsigned option, or `fallback` if absent or unparsable. Accepts `0x`
/// hex.
pub fn get_usize(key: &str, fallback: usize) -> usize {
    let Some(value) = find_value(key) else {
        return fallback;
    };
    let (digits, radix) = match value.strip_prefix("0x") {
        Some(hex) => (hex, 16),
        None => (value, 10),
    };
    usize::from_str_radix(digits, radix).unwrap_or(fallback)
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use super::*;

    fn setup() {
        init("console=ttyS0 modules=\"/boot/extra modules\" smp=4 nvme=0 base=0x1000");
    }

    #[test]
    fn string_options_resolve() {
        setup();
        assert_eq!(get_str("console", "tty0"), "ttyS0");
        assert_eq!(get_str("missing", "fallback"), "fallback");
    }

    #[test]
    fn quoted_values_keep_spaces() {
        setup();
        assert_eq!(get_str("modules", "/boot/modules"), "/boot/extra modules");
    }

    #[test]
    fn numeric_options_resolve() {
        setup();
        assert_eq!(get_usize("smp", 1), 4);
        assert_eq!(get_usize("base", 0), 0x1000);
        assert_eq!(get_usize("missing", 7), 7);
    }

    #[test]
    fn module_toggle_reads_as_zero() {
        setup();
        assert_eq!(get_usize("nvme", 1), 0);
        // An unlisted module stays enabled.
        assert_eq!(get_usize("ps2_keyboard", 1), 1);
    }
}
