//! Kernel topology install/update/teardown (spec.md §4.1).
//!
//! `ifb0`'s tree, once installed, looks like:
//!
//! ```text
//! root  1:0  dsmark indices 4 default_index 0
//!        └── 2:0  htb r2q 2
//!              ├── 2:1  htb rate 50000 ceil 50000   (interactive/SSH reserve)
//!              │     └── 3:0  sfq
//!              ├── 2:2  htb rate <stream_rate>      (protected stream)
//!              │     └── 4:0  sfq
//!              └── 2:3  htb rate <background_rate>
//!                           ceil <background_rate>  (throttled background)
//!                    └── 5:0  sfq
//! ```
//!
//! classified by a two-stage filter: a `u32` match on the dsmark qdisc `1:`
//! picks a dsmark index by TCP/IP 4-tuple, and a `tcindex` classifier on
//! `2:0` maps that index to one of the three htb classes.

use crate::tc::error::TcError;
use crate::tc::flow::FlowKey;
use crate::tc::shell::{ignore_tc, must_tc};

const ESTIMATOR: &[&str] = &["estimator", "250ms", "500ms"];

/// Last-installed parameters, cached so `add_rules` can tell an update from
/// a full reinstall (spec.md's "Install/update policy").
#[derive(Debug, Clone, Default)]
pub struct TopologyCache {
    pub previous_port: i32,
    pub previous_stream_rate: u64,
    pub previous_background_rate: u64,
}

impl TopologyCache {
    pub fn none() -> Self {
        Self {
            previous_port: -1,
            previous_stream_rate: 0,
            previous_background_rate: 0,
        }
    }

    pub fn is_installed(&self) -> bool {
        self.previous_port != -1
    }
}

fn cmd(parts: &[&str]) -> Vec<String> {
    parts.iter().map(|s| s.to_string()).collect()
}

fn args_of(v: &[String]) -> Vec<&str> {
    v.iter().map(|s| s.as_str()).collect()
}

/// Install the ingress redirection on the primary interface: an ingress
/// qdisc plus a catch-all filter that mirrors every incoming packet to
/// `ifb`'s egress (spec.md §4.1 `init_ifb`).
pub fn install_ingress_redirect(main_iface: &str, ifb: &str) -> Result<(), TcError> {
    ignore_tc(&["qdisc", "del", "dev", main_iface, "ingress"]);

    let mut add = vec!["qdisc", "add", "dev", main_iface];
    add.extend_from_slice(ESTIMATOR);
    add.extend_from_slice(&["handle", "ffff:", "ingress"]);
    must_tc(&add)?;

    must_tc(&[
        "filter", "add", "dev", main_iface, "parent", "ffff:", "protocol", "ip", "u32", "match",
        "u32", "0", "0", "action", "mirred", "egress", "redirect", "dev", ifb,
    ])
}

/// Remove the ingress qdisc on the primary interface (part of `uninit`).
/// Tolerated if already absent.
pub fn teardown_ingress_redirect(main_iface: &str) {
    ignore_tc(&["qdisc", "del", "dev", main_iface, "ingress"]);
}

/// Tear down the root and ingress qdiscs on `ifb` - `del_rules` in spec.md.
/// Idempotent: calling this with nothing installed is a no-op.
pub fn teardown(ifb: &str) {
    ignore_tc(&["qdisc", "del", "dev", ifb, "root"]);
    ignore_tc(&["qdisc", "del", "dev", ifb, "ingress"]);
}

/// Full install: dsmark root, htb classes, sfq leaves, and the two-stage
/// classifier. Called only on a fresh flow / port change; an in-place update
/// goes through [`update_rates`] instead.
pub fn install_full(
    ifb: &str,
    flow: FlowKey,
    stream_rate: u64,
    background_rate: u64,
) -> Result<(), TcError> {
    // masks: a zero field means "don't match on this field"
    let ip_src_mask = FlowKey::ip_mask(flow.dst_ip); // remote sender's IP = our flow's dst_ip
    let ip_dst_mask = FlowKey::ip_mask(flow.src_ip); // client's own IP = our flow's src_ip
    let tcp_sport_mask = FlowKey::port_mask(flow.dst_port); // remote sender's port
    let tcp_dport_mask = FlowKey::port_mask(flow.src_port); // client's own port

    let stream_rate_s = format!("{stream_rate}bps");
    let background_rate_s = format!("{background_rate}bps");

    let mut c1 = vec!["qdisc", "add", "dev", ifb];
    c1.extend_from_slice(ESTIMATOR);
    c1.extend_from_slice(&[
        "handle",
        "1:0",
        "root",
        "dsmark",
        "indices",
        "4",
        "default_index",
        "0",
    ]);
    must_tc(&c1)?;

    let mut c2 = vec!["qdisc", "add", "dev", ifb];
    c2.extend_from_slice(ESTIMATOR);
    c2.extend_from_slice(&["handle", "2:0", "parent", "1:0", "htb", "r2q", "2"]);
    must_tc(&c2)?;

    let mut c3 = vec!["class", "add", "dev", ifb];
    c3.extend_from_slice(ESTIMATOR);
    c3.extend_from_slice(&[
        "parent", "2:0", "classid", "2:1", "htb", "rate", "50000bps", "ceil", "50000bps",
    ]);
    must_tc(&c3)?;

    let mut c4 = vec!["qdisc", "add", "dev", ifb];
    c4.extend_from_slice(ESTIMATOR);
    c4.extend_from_slice(&["handle", "3:0", "parent", "2:1", "sfq"]);
    must_tc(&c4)?;

    let mut c5 = vec!["class", "add", "dev", ifb];
    c5.extend_from_slice(ESTIMATOR);
    c5.extend_from_slice(&[
        "parent",
        "2:0",
        "classid",
        "2:2",
        "htb",
        "rate",
        &stream_rate_s,
    ]);
    must_tc(&c5)?;

    let mut c6 = vec!["qdisc", "add", "dev", ifb];
    c6.extend_from_slice(ESTIMATOR);
    c6.extend_from_slice(&["handle", "4:0", "parent", "2:2", "sfq"]);
    must_tc(&c6)?;

    let mut c7 = vec!["class", "add", "dev", ifb];
    c7.extend_from_slice(ESTIMATOR);
    c7.extend_from_slice(&[
        "parent",
        "2:0",
        "classid",
        "2:3",
        "htb",
        "rate",
        &background_rate_s,
        "ceil",
        &background_rate_s,
    ]);
    must_tc(&c7)?;

    let mut c8 = vec!["qdisc", "add", "dev", ifb];
    c8.extend_from_slice(ESTIMATOR);
    c8.extend_from_slice(&["handle", "5:0", "parent", "2:3", "sfq"]);
    must_tc(&c8)?;

    // tcindex classifier on 2:0 dispatching indices 1/2/3 to the three classes
    must_tc(&[
        "filter", "add", "dev", ifb, "parent", "2:0", "protocol", "all", "prio", "1", "tcindex",
        "mask", "0x3", "shift", "0",
    ])?;
    must_tc(&[
        "filter", "add", "dev", ifb, "parent", "2:0", "protocol", "all", "prio", "1", "handle",
        "3", "tcindex", "classid", "2:3",
    ])?;
    must_tc(&[
        "filter", "add", "dev", ifb, "parent", "2:0", "protocol", "all", "prio", "1", "handle",
        "2", "tcindex", "classid", "2:2",
    ])?;
    must_tc(&[
        "filter", "add", "dev", ifb, "parent", "2:0", "protocol", "all", "prio", "1", "handle",
        "1", "tcindex", "classid", "2:1",
    ])?;

    // two-stage u32 classifier on the dsmark qdisc 1:0: match TCP (protocol
    // offset 9 == 0x06), then hash-chain into a port-22 (interactive) check
    // and a 4-tuple (stream) check, falling through to background otherwise.
    must_tc(&[
        "filter", "add", "dev", ifb, "parent", "1:0", "protocol", "all", "prio", "1", "handle",
        "1:0:0", "u32", "divisor", "1",
    ])?;
    must_tc(&[
        "filter", "add", "dev", ifb, "parent", "1:0", "protocol", "all", "prio", "1", "u32",
        "match", "u8", "0x6", "0xff", "at", "9", "offset", "at", "0", "mask", "0f00", "shift",
        "6", "eat", "link", "1:0:0",
    ])?;
    must_tc(&[
        "filter", "add", "dev", ifb, "parent", "1:0", "protocol", "all", "prio", "1", "handle",
        "1:0:1", "u32", "ht", "1:0:0", "match", "u16", "0x16", "0xffff", "at", "2", "classid",
        "1:1",
    ])?;
    must_tc(&[
        "filter", "add", "dev", ifb, "parent", "1:0", "protocol", "all", "prio", "1", "handle",
        "2:0:0", "u32", "divisor", "1",
    ])?;

    let ip_src_hex = format!("0x{:x}", flow.dst_ip);
    let ip_src_mask_hex = format!("0x{ip_src_mask:x}");
    let ip_dst_hex = format!("0x{:x}", flow.src_ip);
    let ip_dst_mask_hex = format!("0x{ip_dst_mask:x}");
    must_tc(&args_of(&cmd_with_ip_match(
        ifb,
        &ip_src_hex,
        &ip_src_mask_hex,
        &ip_dst_hex,
        &ip_dst_mask_hex,
    )))?;

    let tcp_dport_hex = format!("0x{:x}", flow.src_port);
    let tcp_dport_mask_hex = format!("0x{tcp_dport_mask:x}");
    let tcp_sport_hex = format!("0x{:x}", flow.dst_port);
    let tcp_sport_mask_hex = format!("0x{tcp_sport_mask:x}");
    must_tc(&[
        "filter",
        "add",
        "dev",
        ifb,
        "parent",
        "1:0",
        "protocol",
        "all",
        "prio",
        "1",
        "handle",
        "2:0:1",
        "u32",
        "ht",
        "2:0:0",
        "match",
        "u16",
        &tcp_dport_hex,
        &tcp_dport_mask_hex,
        "at",
        "2",
        "match",
        "u16",
        &tcp_sport_hex,
        &tcp_sport_mask_hex,
        "at",
        "0",
        "classid",
        "1:2",
    ])?;

    must_tc(&[
        "filter", "add", "dev", ifb, "parent", "1:0", "protocol", "all", "prio", "1", "u32",
        "match", "u32", "0x0", "0x0", "at", "0", "classid", "1:3",
    ])
}

fn cmd_with_ip_match(
    ifb: &str,
    ip_src_hex: &str,
    ip_src_mask_hex: &str,
    ip_dst_hex: &str,
    ip_dst_mask_hex: &str,
) -> Vec<String> {
    cmd(&[
        "filter",
        "add",
        "dev",
        ifb,
        "parent",
        "1:0",
        "protocol",
        "all",
        "prio",
        "1",
        "u32",
        "match",
        "u8",
        "0x6",
        "0xff",
        "at",
        "9",
        "match",
        "u32",
        ip_src_hex,
        ip_src_mask_hex,
        "at",
        "12",
        "match",
        "u32",
        ip_dst_hex,
        ip_dst_mask_hex,
        "at",
        "16",
        "offset",
        "at",
        "0",
        "mask",
        "0f00",
        "shift",
        "6",
        "eat",
        "link",
        "2:0:0",
    ])
}

/// In-place rate update for an already-installed topology with the same
/// destination port - no qdisc/class churn, no stats reset.
pub fn update_rates(
    ifb: &str,
    cache: &TopologyCache,
    stream_rate: u64,
    background_rate: u64,
) -> Result<(), TcError> {
    if cache.previous_stream_rate != stream_rate {
        must_tc(&[
            "class",
            "change",
            "dev",
            ifb,
            "parent",
            "2:0",
            "classid",
            "2:2",
            "htb",
            "rate",
            &format!("{stream_rate}bps"),
        ])?;
    }

    if cache.previous_background_rate != background_rate {
        must_tc(&[
            "class",
            "change",
            "dev",
            ifb,
            "parent",
            "2:0",
            "classid",
            "2:3",
            "htb",
            "rate",
            &format!("{background_rate}bps"),
            "ceil",
            &format!("{background_rate}bps"),
        ])?;
    }

    Ok(())
}
