//! Policy Controller: translates buffer-fill telemetry into TC Engine calls
//! (spec.md §4.2).
//!
//! A pure state machine driven by four events (`SetPolicy`, `SetFixedPolicy`,
//! `UnsetPolicy`, recompute-timer-fired). It owns no I/O of its own; all
//! kernel interaction is delegated through [`TcControl`].

use crate::tc::error::{TcError, INFINITE_BANDWIDTH, MINIMUM_BANDWIDTH};
use crate::tc::flow::FlowKey;
use crate::tc::TcControl;

pub const PANIC_ENTRY_PCT: u32 = 70;
pub const PANIC_EXIT_PCT: u32 = 100;
pub const RECOMPUTE_PERIOD_MS: u64 = 2000;
pub const GROWTH_FACTOR: f64 = 1.5;

/// Whether a `SetPolicy` call should (re)arm the recompute timer, and
/// whether a recompute just fired and should commit a new background rate.
/// The daemon shell owns the actual `tokio` timer; this enum is what the
/// controller tells it to do with that timer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerAction {
    /// Cancel whatever timer is armed, if any.
    Cancel,
    /// Arm a timer if none is armed; leave an existing one alone.
    ArmIfIdle,
    /// Re-arm (always replace) - used after a recompute commit.
    Rearm,
}

/// Policy State (spec.md §3), owned exclusively by the single-threaded event
/// loop - no `Clone`, no sharing.
#[derive(Debug, Default)]
pub struct PolicyController {
    current_flow: Option<FlowKey>,
    bitrate_hint: u32,
    buffer_fill: f64,
    buffer_pct: u32,
    in_panic: bool,
    background_rate: u64,
    timer_armed: bool,
    fixed: bool,
}

impl PolicyController {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn current_flow(&self) -> Option<FlowKey> {
        self.current_flow
    }

    pub fn in_panic(&self) -> bool {
        self.in_panic
    }

    pub fn background_rate(&self) -> u64 {
        self.background_rate
    }

    pub fn buffer_pct(&self) -> u32 {
        self.buffer_pct
    }

    pub fn timer_armed(&self) -> bool {
        self.timer_armed
    }

    fn set_background_rate(&mut self, rate: u64) {
        self.background_rate = rate.clamp(MINIMUM_BANDWIDTH, INFINITE_BANDWIDTH);
    }

    /// `SetPolicy(flow, bitrate, buffer_fill)` — adaptive path.
    ///
    /// Returns the `TimerAction` the caller (the daemon event loop) must
    /// apply to its own timer handle.
    pub fn set_policy(
        &mut self,
        tc: &mut dyn TcControl,
        flow: FlowKey,
        bitrate: u32,
        buffer_fill: f64,
    ) -> Result<TimerAction, TcError> {
        self.fixed = false;
        self.bitrate_hint = bitrate;
        self.buffer_fill = buffer_fill;
        let pct = (buffer_fill * 100.0).round() as u32;
        self.buffer_pct = pct;

        let new_panic_edge = pct < PANIC_ENTRY_PCT && !self.in_panic;
        if new_panic_edge {
            self.in_panic = true;
        }
        if pct == PANIC_EXIT_PCT {
            self.in_panic = false;
        }

        let port_changed = self
            .current_flow
            .map(|f| f.src_port != flow.src_port)
            .unwrap_or(true);

        if new_panic_edge || port_changed {
            self.set_background_rate(MINIMUM_BANDWIDTH);
            self.current_flow = Some(flow);
            self.timer_armed = false;
            tc.add_rules(flow, INFINITE_BANDWIDTH, self.background_rate)?;
            Ok(TimerAction::Cancel)
        } else {
            self.current_flow = Some(flow);
            self.timer_armed = true;
            Ok(TimerAction::ArmIfIdle)
        }
    }

    /// Recompute timer fired: apply one AIMD step.
    pub fn on_recompute(&mut self, tc: &mut dyn TcControl) -> Result<TimerAction, TcError> {
        let flow = match self.current_flow {
            Some(f) => f,
            None => {
                self.timer_armed = false;
                return Ok(TimerAction::Cancel);
            }
        };

        let next = if self.in_panic {
            MINIMUM_BANDWIDTH
        } else {
            let grown = self.background_rate as f64 * GROWTH_FACTOR;
            if grown.is_finite() && grown <= INFINITE_BANDWIDTH as f64 {
                grown as u64
            } else {
                self.background_rate
            }
        };

        if next != self.background_rate {
            self.set_background_rate(next);
            tc.add_rules(flow, INFINITE_BANDWIDTH, self.background_rate)?;
        }

        self.timer_armed = true;
        Ok(TimerAction::Rearm)
    }

    /// `UnsetPolicy`, or an implicit one synthesized from a vanished bus peer.
    pub fn unset_policy(&mut self, tc: &mut dyn TcControl) {
        self.timer_armed = false;
        tc.del_rules();
        self.current_flow = None;
        self.in_panic = false;
        self.background_rate = 0;
        self.fixed = false;
    }

    /// `SetFixedPolicy(flow, stream_rate, background_rate)` — manual
    /// override; the controller stops adapting until the next `SetPolicy`/
    /// `UnsetPolicy`. Always cancels any armed recompute timer, mirroring
    /// the original's `on_set_fixed_policy` removing its GLib timeout source
    /// before installing the fixed rates - otherwise a timer left over from
    /// a prior adaptive `SetPolicy` would fire later and overwrite the
    /// operator's fixed rates with an AIMD-grown one.
    pub fn set_fixed_policy(
        &mut self,
        tc: &mut dyn TcControl,
        flow: FlowKey,
        stream_rate: u64,
        background_rate: u64,
    ) -> Result<TimerAction, TcError> {
        self.timer_armed = false;
        self.fixed = true;
        self.current_flow = Some(flow);
        self.set_background_rate(background_rate);
        tc.add_rules(flow, stream_rate, self.background_rate)?;
        Ok(TimerAction::Cancel)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tc::mock::MockTc;

    fn flow(src_port: u16, dst_port: u16) -> FlowKey {
        FlowKey {
            src_ip: 0x0100007f,
            src_port,
            dst_ip: 0x0402_0301,
            dst_port,
        }
    }

    #[test]
    fn happy_path_installs_without_panic_or_timer() {
        let mut tc = MockTc::new();
        let mut ctl = PolicyController::new();

        let action = ctl
            .set_policy(&mut tc, flow(54321, 80), 500_000, 1.0)
            .unwrap();

        assert!(!ctl.in_panic());
        assert_eq!(action, TimerAction::Cancel);
        assert_eq!(*tc.install_count.borrow(), 1);
        assert_eq!(ctl.background_rate(), MINIMUM_BANDWIDTH);
    }

    #[test]
    fn same_port_update_arms_timer_and_stays_on_update_path() {
        let mut tc = MockTc::new();
        let mut ctl = PolicyController::new();
        ctl.set_policy(&mut tc, flow(54321, 80), 500_000, 1.0).unwrap();

        let action = ctl
            .set_policy(&mut tc, flow(54321, 80), 500_000, 0.98)
            .unwrap();

        assert_eq!(action, TimerAction::ArmIfIdle);
        assert_eq!(*tc.install_count.borrow(), 1);
        assert_eq!(*tc.update_count.borrow(), 0); // no recompute has fired yet, so no add_rules call at all
    }

    #[test]
    fn recompute_grows_background_rate_by_growth_factor() {
        let mut tc = MockTc::new();
        let mut ctl = PolicyController::new();
        ctl.set_policy(&mut tc, flow(54321, 80), 500_000, 1.0).unwrap();

        ctl.on_recompute(&mut tc).unwrap();

        assert_eq!(ctl.background_rate(), 7500);
    }

    #[test]
    fn panic_entry_snaps_background_rate_to_minimum() {
        let mut tc = MockTc::new();
        let mut ctl = PolicyController::new();
        ctl.set_policy(&mut tc, flow(54321, 80), 500_000, 1.0).unwrap();
        ctl.on_recompute(&mut tc).unwrap(); // grow to 7500

        let action = ctl
            .set_policy(&mut tc, flow(54321, 80), 500_000, 0.60)
            .unwrap();

        assert!(ctl.in_panic());
        assert_eq!(ctl.background_rate(), MINIMUM_BANDWIDTH);
        assert_eq!(action, TimerAction::Cancel);
    }

    #[test]
    fn flow_swap_forces_reinstall_regardless_of_fill() {
        let mut tc = MockTc::new();
        let mut ctl = PolicyController::new();
        ctl.set_policy(&mut tc, flow(1111, 80), 500_000, 1.0).unwrap();
        ctl.set_policy(&mut tc, flow(2222, 80), 500_000, 1.0).unwrap();

        assert_eq!(*tc.install_count.borrow(), 2);
    }

    #[test]
    fn unset_policy_returns_to_idle() {
        let mut tc = MockTc::new();
        let mut ctl = PolicyController::new();
        ctl.set_policy(&mut tc, flow(54321, 80), 500_000, 1.0).unwrap();

        ctl.unset_policy(&mut tc);

        assert!(ctl.current_flow().is_none());
        assert!(!ctl.in_panic());
        assert_eq!(*tc.teardown_count.borrow(), 2); // teardown-before-install + unset
    }

    #[test]
    fn panic_exit_requires_exact_full_buffer() {
        let mut tc = MockTc::new();
        let mut ctl = PolicyController::new();
        ctl.set_policy(&mut tc, flow(54321, 80), 500_000, 0.5).unwrap();
        assert!(ctl.in_panic());

        ctl.set_policy(&mut tc, flow(54321, 80), 500_000, 0.99).unwrap();
        assert!(ctl.in_panic(), "99% must not exit panic");

        ctl.set_policy(&mut tc, flow(54321, 80), 500_000, 1.0).unwrap();
        assert!(!ctl.in_panic(), "exactly 100% must exit panic");
    }

    #[test]
    fn background_rate_always_within_bounds() {
        let mut tc = MockTc::new();
        let mut ctl = PolicyController::new();
        ctl.set_policy(&mut tc, flow(54321, 80), 500_000, 1.0).unwrap();
        for _ in 0..200 {
            ctl.on_recompute(&mut tc).unwrap();
            assert!(ctl.background_rate() >= MINIMUM_BANDWIDTH);
            assert!(ctl.background_rate() <= INFINITE_BANDWIDTH);
        }
    }

    #[test]
    fn fixed_policy_bypasses_adaptation() {
        let mut tc = MockTc::new();
        let mut ctl = PolicyController::new();

        ctl.set_fixed_policy(&mut tc, FlowKey::ANY, 200_000, 50_000)
            .unwrap();

        assert!(!ctl.timer_armed());
        assert_eq!(ctl.background_rate(), 50_000);
        assert_eq!(*tc.install_count.borrow(), 1);
    }

    #[test]
    fn fixed_policy_cancels_a_timer_armed_by_a_prior_adaptive_set_policy() {
        let mut tc = MockTc::new();
        let mut ctl = PolicyController::new();

        let action = ctl
            .set_policy(&mut tc, flow(54321, 80), 500_000, 0.98)
            .unwrap();
        assert_eq!(action, TimerAction::ArmIfIdle);
        assert!(ctl.timer_armed());

        let action = ctl
            .set_fixed_policy(&mut tc, FlowKey::ANY, 200_000, 50_000)
            .unwrap();

        assert_eq!(action, TimerAction::Cancel);
        assert!(!ctl.timer_armed());

        // even if a stale timer fired anyway, a recompute must not disturb
        // the fixed rate while `fixed_policy`'s caller has already cancelled
        // the daemon's timer handle in response to `TimerAction::Cancel`.
        assert_eq!(ctl.background_rate(), 50_000);
    }
}
