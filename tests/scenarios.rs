//! End-to-end scenarios S1-S6 (spec.md §8), driven against `MockTc`.

use tcmmd::policy::{PolicyController, TimerAction};
use tcmmd::tc::flow::FlowKey;
use tcmmd::tc::mock::MockTc;
use tcmmd::tc::TcControl;

fn flow(src_ip: &str, src_port: u16, dst_ip: &str, dst_port: u16) -> FlowKey {
    FlowKey {
        src_ip: FlowKey::parse_ip(src_ip).unwrap(),
        src_port,
        dst_ip: FlowKey::parse_ip(dst_ip).unwrap(),
        dst_port,
    }
}

#[test]
fn s1_happy_path_then_update_then_growth() {
    let mut tc = MockTc::new();
    let mut ctl = PolicyController::new();

    let action = ctl
        .set_policy(&mut tc, flow("10.0.0.1", 54321, "1.2.3.4", 80), 500_000, 1.0)
        .unwrap();
    assert!(!ctl.in_panic());
    assert_eq!(action, TimerAction::Cancel);
    assert_eq!(*tc.install_count.borrow(), 1);

    let action = ctl
        .set_policy(&mut tc, flow("10.0.0.1", 54321, "1.2.3.4", 80), 500_000, 0.98)
        .unwrap();
    assert_eq!(action, TimerAction::ArmIfIdle);
    assert_eq!(*tc.install_count.borrow(), 1, "same dst_port stays on the update path");

    ctl.on_recompute(&mut tc).unwrap();
    assert_eq!(ctl.background_rate(), 7500);
}

#[test]
fn s2_panic_entry_snaps_rate_and_reinstalls() {
    let mut tc = MockTc::new();
    let mut ctl = PolicyController::new();
    ctl.set_policy(&mut tc, flow("10.0.0.1", 54321, "1.2.3.4", 80), 500_000, 1.0)
        .unwrap();
    ctl.on_recompute(&mut tc).unwrap();
    assert_eq!(ctl.background_rate(), 7500);

    let action = ctl
        .set_policy(&mut tc, flow("10.0.0.1", 54321, "1.2.3.4", 80), 500_000, 0.60)
        .unwrap();

    assert!(ctl.in_panic());
    assert_eq!(ctl.background_rate(), 5000);
    assert_eq!(action, TimerAction::Cancel);
}

#[test]
fn s3_flow_swap_forces_full_reinstall_regardless_of_fill() {
    let mut tc = MockTc::new();
    let mut ctl = PolicyController::new();
    ctl.set_policy(&mut tc, flow("10.0.0.1", 1111, "1.2.3.4", 80), 500_000, 1.0)
        .unwrap();
    ctl.set_policy(&mut tc, flow("10.0.0.1", 2222, "1.2.3.4", 80), 500_000, 1.0)
        .unwrap();

    assert_eq!(*tc.install_count.borrow(), 2);
}

#[test]
fn s4_peer_death_returns_to_idle() {
    let mut tc = MockTc::new();
    let mut ctl = PolicyController::new();
    ctl.set_policy(&mut tc, flow("10.0.0.1", 54321, "1.2.3.4", 80), 500_000, 1.0)
        .unwrap();

    // NameOwnerChanged synthesizes exactly this call.
    ctl.unset_policy(&mut tc);

    assert!(ctl.current_flow().is_none());
    assert!(tc.installed_flow.borrow().is_none());
}

#[test]
fn s5_fixed_policy_installs_exact_rates_then_adaptive_resumes() {
    let mut tc = MockTc::new();
    let mut ctl = PolicyController::new();

    let action = ctl
        .set_fixed_policy(&mut tc, FlowKey::ANY, 200_000, 50_000)
        .unwrap();
    assert_eq!(action, TimerAction::Cancel);
    assert_eq!(ctl.background_rate(), 50_000);
    assert!(!ctl.timer_armed());

    ctl.set_policy(&mut tc, flow("10.0.0.1", 54321, "1.2.3.4", 80), 500_000, 1.0)
        .unwrap();
    assert_eq!(ctl.background_rate(), 5000);
}

#[test]
fn s5b_fixed_policy_cancels_a_timer_left_armed_by_a_prior_set_policy() {
    let mut tc = MockTc::new();
    let mut ctl = PolicyController::new();

    // an adaptive SetPolicy on an unchanged flow arms the recompute timer.
    ctl.set_policy(&mut tc, flow("10.0.0.1", 54321, "1.2.3.4", 80), 500_000, 0.98)
        .unwrap();
    let action = ctl
        .set_policy(&mut tc, flow("10.0.0.1", 54321, "1.2.3.4", 80), 500_000, 0.96)
        .unwrap();
    assert_eq!(action, TimerAction::ArmIfIdle);
    assert!(ctl.timer_armed());

    // SetFixedPolicy must tell the daemon to cancel that timer, not leave it
    // armed to later overwrite the operator's fixed rates. The daemon event
    // loop aborts its JoinHandle in response, so the timer this cancels
    // never actually ticks again - `on_recompute` is never reached while
    // a fixed policy is in effect.
    let action = ctl
        .set_fixed_policy(&mut tc, FlowKey::ANY, 200_000, 50_000)
        .unwrap();
    assert_eq!(action, TimerAction::Cancel);
    assert!(!ctl.timer_armed());
    assert_eq!(ctl.background_rate(), 50_000);
}

#[test]
fn s6_signal_exit_tears_down_completely() {
    let mut tc = MockTc::new();
    let mut ctl = PolicyController::new();
    ctl.set_policy(&mut tc, flow("10.0.0.1", 54321, "1.2.3.4", 80), 500_000, 1.0)
        .unwrap();

    // mirrors daemon::run's clean-shutdown path: uninit() then the weak
    // teardown guard finds nothing left to do.
    tc.uninit();

    assert!(tc.installed_flow.borrow().is_none());
    assert!(!tc.ifb_ready);
}

#[test]
fn del_rules_is_idempotent() {
    let mut tc = MockTc::new();
    tc.del_rules();
    tc.del_rules();
    assert!(tc.installed_flow.borrow().is_none());
}
