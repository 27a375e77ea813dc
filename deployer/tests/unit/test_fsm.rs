//! Step lifecycle FSM tests

use ethdeploy::engine::fsm::{StepEvent, StepFsm, StepState};

#[test]
fn test_fsm_initial_state() {
    let fsm = StepFsm::new();
    assert_eq!(fsm.state(), StepState::Pending);
    assert!(fsm.error().is_none());
    assert_eq!(fsm.attempts(), 0);
    assert!(!fsm.is_terminal());
}

#[test]
fn test_fsm_fail_then_succeed() {
    let mut fsm = StepFsm::new();

    fsm.process(StepEvent::Start).unwrap();
    fsm.process(StepEvent::Fail("exit status 1".to_string())).unwrap();
    assert_eq!(fsm.state(), StepState::Failed);
    assert_eq!(fsm.error(), Some("exit status 1"));

    fsm.process(StepEvent::Retry).unwrap();
    assert_eq!(fsm.state(), StepState::Retrying);
    fsm.process(StepEvent::Start).unwrap();
    fsm.process(StepEvent::Succeed).unwrap();

    assert_eq!(fsm.state(), StepState::Succeeded);
    assert!(fsm.error().is_none());
    assert_eq!(fsm.retries(), 1);
}

#[test]
fn test_fsm_give_up_during_backoff() {
    let mut fsm = StepFsm::new();
    fsm.process(StepEvent::Start).unwrap();
    fsm.process(StepEvent::Fail("timeout".to_string())).unwrap();
    fsm.process(StepEvent::Retry).unwrap();
    fsm.process(StepEvent::GiveUp).unwrap();

    assert_eq!(fsm.state(), StepState::Failed);
    assert_eq!(fsm.attempts(), 1);
    assert!(fsm.is_terminal());
}

#[test]
fn test_fsm_can_retry() {
    let mut fsm = StepFsm::new();
    assert!(!fsm.can_retry(3));

    fsm.process(StepEvent::Start).unwrap();
    fsm.process(StepEvent::Fail("e".to_string())).unwrap();
    assert!(fsm.can_retry(1));
    assert!(!fsm.can_retry(0));
}

#[test]
fn test_fsm_skip_only_from_pending() {
    let mut fsm = StepFsm::new();
    fsm.process(StepEvent::Skip).unwrap();
    assert_eq!(fsm.state(), StepState::Skipped);

    let mut running = StepFsm::new();
    running.process(StepEvent::Start).unwrap();
    assert!(running.process(StepEvent::Skip).is_err());
}

#[test]
fn test_fsm_invalid_transitions() {
    let mut fsm = StepFsm::new();
    assert!(fsm.process(StepEvent::Succeed).is_err());
    assert!(fsm.process(StepEvent::Retry).is_err());

    fsm.process(StepEvent::Start).unwrap();
    fsm.process(StepEvent::Succeed).unwrap();
    assert!(fsm.process(StepEvent::Start).is_err());
}
