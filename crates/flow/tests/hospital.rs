use flow::{Diagnosis, FailureReport, FlowFailure, FlowHospital, FlowId, FlowState, HospitalConfig};
use std::time::Duration;

fn report(flow_id: FlowId, failure: FlowFailure, suspend_count: u64) -> FailureReport {
  FailureReport { flow_id,
                  failure,
                  last_state: FlowState::Runnable,
                  checkpoint_version: 1,
                  suspend_count,
                  inbound: None }
}

fn hospital(retry_session_timeouts: bool) -> FlowHospital {
  FlowHospital::new(HospitalConfig { max_retries: 3,
                                     base_backoff: Duration::from_millis(100),
                                     max_backoff: Duration::from_millis(300),
                                     retry_session_timeouts })
}

#[test]
fn transient_failures_back_off_then_observe() {
  let h = hospital(false);
  let id = FlowId::new();
  let diagnoses: Vec<Diagnosis> = (0..4).map(|_| h.admit(&report(id, FlowFailure::transient("db down"), 2)))
                                        .collect();
  assert_eq!(diagnoses[0],
             Diagnosis::Discharge { attempt: 1,
                                    backoff: Duration::from_millis(100) });
  assert_eq!(diagnoses[1],
             Diagnosis::Discharge { attempt: 2,
                                    backoff: Duration::from_millis(200) });
  // capped by max_backoff
  assert_eq!(diagnoses[2],
             Diagnosis::Discharge { attempt: 3,
                                    backoff: Duration::from_millis(300) });
  assert_eq!(diagnoses[3], Diagnosis::OvernightObservation);
  assert_eq!(h.patients(), vec![id]);
  assert_eq!(h.medical_history(&id).len(), 4);
}

#[test]
fn attempts_are_counted_per_step() {
  let h = hospital(false);
  let id = FlowId::new();
  h.admit(&report(id, FlowFailure::transient("x"), 1));
  h.admit(&report(id, FlowFailure::transient("x"), 1));
  let next_step = h.admit(&report(id, FlowFailure::transient("x"), 2));
  assert!(matches!(next_step, Diagnosis::Discharge { attempt: 1, .. }));
}

#[test]
fn classification_by_kind() {
  let h = hospital(false);
  let id = FlowId::new();
  assert_eq!(h.admit(&report(id, FlowFailure::rejected("no funds"), 0)), Diagnosis::Terminal);
  assert_eq!(h.admit(&report(id, FlowFailure::cancelled("stop"), 0)), Diagnosis::Terminal);
  assert_eq!(h.admit(&report(id, FlowFailure::timeout("late"), 0)), Diagnosis::Terminal);
  assert_eq!(h.admit(&report(id, FlowFailure::internal("bug"), 0)), Diagnosis::OvernightObservation);
}

#[test]
fn session_timeouts_can_be_retryable() {
  let h = hospital(true);
  let d = h.admit(&report(FlowId::new(), FlowFailure::timeout("late"), 0));
  assert!(matches!(d, Diagnosis::Discharge { attempt: 1, .. }));
}

#[test]
fn release_and_forget() {
  let h = hospital(false);
  let id = FlowId::new();
  h.admit(&report(id, FlowFailure::internal("bug"), 0));
  assert!(h.is_under_observation(&id));
  h.release(&id);
  assert!(h.patients().is_empty());
  // a manual retry gets a fresh retry budget
  assert!(matches!(h.admit(&report(id, FlowFailure::transient("x"), 0)), Diagnosis::Discharge { attempt: 1, .. }));
  h.forget(&id);
  assert!(h.medical_history(&id).is_empty());
}
