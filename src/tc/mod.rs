//! The TC Engine: owns the kernel-facing half of the daemon (spec.md §4.1).
//!
//! `TcEngine` is the only thing in this crate that shells out to `tc`/`ip`.
//! Everything above it (the policy controller, the RPC layer) talks to the
//! [`TcControl`] trait instead, so tests can swap in [`MockTc`] and assert on
//! invariants without root or a real `ifb` device.

pub mod error;
pub mod flow;
pub mod interface;
pub mod shell;
pub mod stats;
pub mod topology;

use error::TcError;
use flow::FlowKey;
use stats::TcStats;
use topology::TopologyCache;

/// The subset of kernel operations the policy controller and RPC layer need.
/// Grounded on the donor crate's `ThrottleManager` trait seam (`backends/mod.rs`),
/// generalized from "one backend per platform" to "one backend for tests, one
/// for the real kernel".
pub trait TcControl {
    fn init(&mut self, iface_hint: Option<&str>) -> Result<(), TcError>;
    fn init_ifb(&mut self) -> Result<(), TcError>;
    fn add_rules(
        &mut self,
        flow: FlowKey,
        stream_rate: u64,
        background_rate: u64,
    ) -> Result<(), TcError>;
    fn del_rules(&mut self);
    fn uninit(&mut self);
    fn get_stats(&self) -> Result<TcStats, TcError>;
}

/// Real kernel-backed implementation. Shells out to `/sbin/tc` and `/sbin/ip`
/// per [`shell`].
pub struct TcEngine {
    main_iface: Option<String>,
    ifb: String,
    cache: TopologyCache,
}

impl TcEngine {
    pub fn new(ifb: impl Into<String>) -> Self {
        Self {
            main_iface: None,
            ifb: ifb.into(),
            cache: TopologyCache::none(),
        }
    }

    pub fn main_iface(&self) -> Option<&str> {
        self.main_iface.as_deref()
    }
}

impl TcControl for TcEngine {
    fn init(&mut self, iface_hint: Option<&str>) -> Result<(), TcError> {
        let iface = interface::select_primary(iface_hint)?;
        log::info!("selected primary interface {iface}");
        self.main_iface = Some(iface);
        Ok(())
    }

    fn init_ifb(&mut self) -> Result<(), TcError> {
        interface::ensure_ifb_up(&self.ifb)?;
        let main_iface = self
            .main_iface
            .as_deref()
            .expect("init must run before init_ifb");
        topology::install_ingress_redirect(main_iface, &self.ifb)?;
        log::info!("ifb {} ready, redirecting ingress from {main_iface}", self.ifb);
        Ok(())
    }

    /// Install or update the shaping topology (spec.md's Install/update
    /// policy): same destination port as last time is an in-place rate
    /// change, anything else is a full teardown and reinstall.
    fn add_rules(
        &mut self,
        flow: FlowKey,
        stream_rate: u64,
        background_rate: u64,
    ) -> Result<(), TcError> {
        let dst_port = flow.dst_port as i32;

        if self.cache.is_installed() && self.cache.previous_port == dst_port {
            topology::update_rates(&self.ifb, &self.cache, stream_rate, background_rate)?;
        } else {
            topology::teardown(&self.ifb);
            topology::install_full(&self.ifb, flow, stream_rate, background_rate)?;
        }

        self.cache = TopologyCache {
            previous_port: dst_port,
            previous_stream_rate: stream_rate,
            previous_background_rate: background_rate,
        };
        Ok(())
    }

    fn del_rules(&mut self) {
        topology::teardown(&self.ifb);
        self.cache = TopologyCache::none();
    }

    fn uninit(&mut self) {
        self.del_rules();
        if let Some(main_iface) = &self.main_iface {
            topology::teardown_ingress_redirect(main_iface);
        }
    }

    fn get_stats(&self) -> Result<TcStats, TcError> {
        stats::read(&self.ifb)
    }
}

/// Exposed unconditionally (not `#[cfg(test)]`-gated) so `tests/scenarios.rs`
/// - a separate integration-test binary - can depend on it too.
pub mod mock {
    use super::*;
    use std::cell::RefCell;

    /// In-memory fake satisfying [`TcControl`], used by `PolicyController`
    /// tests and the scenario tests in `tests/scenarios.rs`.
    #[derive(Default)]
    pub struct MockTc {
        pub initialized: bool,
        pub ifb_ready: bool,
        pub installed_flow: RefCell<Option<FlowKey>>,
        pub stream_rate: RefCell<u64>,
        pub background_rate: RefCell<u64>,
        pub install_count: RefCell<u32>,
        pub update_count: RefCell<u32>,
        pub teardown_count: RefCell<u32>,
        pub stats: RefCell<TcStats>,
        cache: RefCell<TopologyCache>,
    }

    impl MockTc {
        pub fn new() -> Self {
            Self {
                cache: RefCell::new(TopologyCache::none()),
                ..Default::default()
            }
        }
    }

    impl TcControl for MockTc {
        fn init(&mut self, _iface_hint: Option<&str>) -> Result<(), TcError> {
            self.initialized = true;
            Ok(())
        }

        fn init_ifb(&mut self) -> Result<(), TcError> {
            self.ifb_ready = true;
            Ok(())
        }

        fn add_rules(
            &mut self,
            flow: FlowKey,
            stream_rate: u64,
            background_rate: u64,
        ) -> Result<(), TcError> {
            let dst_port = flow.dst_port as i32;
            let mut cache = self.cache.borrow_mut();

            if cache.is_installed() && cache.previous_port == dst_port {
                *self.update_count.borrow_mut() += 1;
            } else {
                *self.teardown_count.borrow_mut() += 1;
                *self.install_count.borrow_mut() += 1;
            }

            *cache = TopologyCache {
                previous_port: dst_port,
                previous_stream_rate: stream_rate,
                previous_background_rate: background_rate,
            };
            *self.installed_flow.borrow_mut() = Some(flow);
            *self.stream_rate.borrow_mut() = stream_rate;
            *self.background_rate.borrow_mut() = background_rate;
            Ok(())
        }

        fn del_rules(&mut self) {
            *self.teardown_count.borrow_mut() += 1;
            *self.installed_flow.borrow_mut() = None;
            *self.cache.borrow_mut() = TopologyCache::none();
        }

        fn uninit(&mut self) {
            self.del_rules();
            self.ifb_ready = false;
        }

        fn get_stats(&self) -> Result<TcStats, TcError> {
            Ok(*self.stats.borrow())
        }
    }

    #[test]
    fn same_port_is_an_update_not_a_reinstall() {
        let mut mock = MockTc::new();
        let flow = FlowKey {
            src_ip: 1,
            src_port: 1000,
            dst_ip: 2,
            dst_port: 443,
        };
        mock.add_rules(flow, 500_000, 50_000).unwrap();
        mock.add_rules(flow, 600_000, 50_000).unwrap();

        assert_eq!(*mock.install_count.borrow(), 1);
        assert_eq!(*mock.update_count.borrow(), 1);
    }

    #[test]
    fn different_port_forces_reinstall() {
        let mut mock = MockTc::new();
        let a = FlowKey {
            src_ip: 1,
            src_port: 1000,
            dst_ip: 2,
            dst_port: 443,
        };
        let b = FlowKey {
            src_ip: 1,
            src_port: 1000,
            dst_ip: 2,
            dst_port: 8443,
        };
        mock.add_rules(a, 500_000, 50_000).unwrap();
        mock.add_rules(b, 500_000, 50_000).unwrap();

        assert_eq!(*mock.install_count.borrow(), 2);
        assert_eq!(*mock.update_count.borrow(), 0);
    }
}
