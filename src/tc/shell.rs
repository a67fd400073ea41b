//! Shell-out helpers for `tc`/`ip` invocations.
//!
//! The kernel state this daemon installs is not fully reachable through any
//! single Rust netlink binding (`tcindex` classifiers in particular are not
//! widely supported), so - like the original daemon - we shell out to
//! `/sbin/tc` and `/sbin/ip`. The exact argument vectors below are the wire
//! format; changing them changes the kernel state this daemon produces.

use crate::tc::error::TcError;
use std::process::{Command, Output};

const TC: &str = "tc";
const IP: &str = "ip";

fn run(bin: &str, args: &[&str]) -> std::io::Result<Output> {
    log::debug!("{} {}", bin, args.join(" "));
    Command::new(bin).args(args).output()
}

/// Run a step that must succeed. Kernel refusal here is fatal (spec.md §4.1,
/// §7 "kernel mutation failure").
pub fn must_tc(args: &[&str]) -> Result<(), TcError> {
    let out = run(TC, args).map_err(|e| TcError::KernelMutation(e.to_string()))?;
    if !out.status.success() {
        return Err(TcError::KernelMutation(format!(
            "tc {} -> {}",
            args.join(" "),
            String::from_utf8_lossy(&out.stderr).trim()
        )));
    }
    Ok(())
}

pub fn must_ip(args: &[&str]) -> Result<(), TcError> {
    let out = run(IP, args).map_err(|e| TcError::KernelMutation(e.to_string()))?;
    if !out.status.success() {
        return Err(TcError::KernelMutation(format!(
            "ip {} -> {}",
            args.join(" "),
            String::from_utf8_lossy(&out.stderr).trim()
        )));
    }
    Ok(())
}

/// Run a deletion step. Absorbed silently per spec.md §7 - the object was
/// likely already gone - but logged at `warn` so a real failure isn't mute.
pub fn ignore_tc(args: &[&str]) {
    match run(TC, args) {
        Ok(out) if !out.status.success() => {
            log::warn!(
                "tc {} -> {} (ignored, assumed already absent)",
                args.join(" "),
                String::from_utf8_lossy(&out.stderr).trim()
            );
        }
        Err(e) => log::warn!("tc {} -> {e} (ignored)", args.join(" ")),
        Ok(_) => {}
    }
}

pub fn tc_output(args: &[&str]) -> Result<String, TcError> {
    let out = run(TC, args).map_err(|e| TcError::CacheSync(e.to_string()))?;
    if !out.status.success() {
        return Err(TcError::CacheSync(format!(
            "tc {} -> {}",
            args.join(" "),
            String::from_utf8_lossy(&out.stderr).trim()
        )));
    }
    Ok(String::from_utf8_lossy(&out.stdout).into_owned())
}
