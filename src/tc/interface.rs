//! Primary interface and `ifb0` discovery.
//!
//! The original daemon walks libnl's link cache filtering on `ARPHRD_ETHER`.
//! The idiomatic Rust equivalent, and the one that keeps this crate's
//! dependency footprint aligned with the donor crate's own interface
//! discovery (which also reads interface state rather than linking a
//! netlink library), is to read the attributes `/sys/class/net/<iface>`
//! already exposes.

use crate::tc::error::TcError;
use crate::tc::shell;
use std::fs;

const ARPHRD_ETHER: u32 = 1;
const IFF_UP: u32 = 0x1;

fn iface_names() -> std::io::Result<Vec<String>> {
    let mut names = Vec::new();
    for entry in fs::read_dir("/sys/class/net")? {
        let entry = entry?;
        if let Some(name) = entry.file_name().to_str() {
            names.push(name.to_string());
        }
    }
    names.sort();
    Ok(names)
}

fn arptype(name: &str) -> Option<u32> {
    fs::read_to_string(format!("/sys/class/net/{name}/type"))
        .ok()
        .and_then(|s| s.trim().parse().ok())
}

fn flags(name: &str) -> Option<u32> {
    fs::read_to_string(format!("/sys/class/net/{name}/flags"))
        .ok()
        .and_then(|s| {
            let s = s.trim().trim_start_matches("0x");
            u32::from_str_radix(s, 16).ok()
        })
}

fn is_up(name: &str) -> bool {
    flags(name).map(|f| f & IFF_UP != 0).unwrap_or(false)
}

/// Select the primary ethernet interface (spec.md §4.1 `init`).
///
/// If `hint` is given, it is used verbatim (no validation that it exists -
/// a missing interface surfaces as a `tc`/`ip` failure on first use, matching
/// the original, which also does not pre-validate an explicit `-i` name).
pub fn select_primary(hint: Option<&str>) -> Result<String, TcError> {
    if let Some(name) = hint {
        return Ok(name.to_string());
    }

    let names = iface_names().map_err(|e| TcError::KernelMutation(e.to_string()))?;
    let candidates: Vec<String> = names
        .into_iter()
        .filter(|n| !n.starts_with("ifb"))
        .filter(|n| arptype(n) == Some(ARPHRD_ETHER))
        .collect();

    match candidates.len() {
        0 => Err(TcError::NoInterface),
        1 => Ok(candidates.into_iter().next().unwrap()),
        _ => Err(TcError::AmbiguousInterface(candidates)),
    }
}

/// Locate `ifb0` and bring it up if necessary (spec.md §4.1 `init_ifb`).
pub fn ensure_ifb_up(ifb: &str) -> Result<(), TcError> {
    let names = iface_names().map_err(|e| TcError::KernelMutation(e.to_string()))?;
    if !names.iter().any(|n| n == ifb) {
        return Err(TcError::NoIfb);
    }

    if !is_up(ifb) {
        shell::must_ip(&["link", "set", "dev", ifb, "up"])?;
    }

    Ok(())
}
