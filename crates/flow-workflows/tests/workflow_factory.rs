use flow::FlowLogic;
use flow_workflows::{AppFlow, WorkflowError, WorkflowFactory, WorkflowType};
use serde_json::json;

#[test]
fn workflow_type_parses_and_displays() {
  assert_eq!("payment".parse::<WorkflowType>().unwrap(), WorkflowType::Payment);
  assert_eq!("NOTARIZE".parse::<WorkflowType>().unwrap(), WorkflowType::Notarise);
  assert_eq!("whatever".parse::<WorkflowType>().unwrap(), WorkflowType::Unknown);
  assert_eq!(WorkflowType::Ping.to_string(), "ping");
  assert_eq!(WorkflowType::default(), WorkflowType::Unknown);
  assert_eq!(WorkflowType::from_kind("notary-client"), WorkflowType::Notarise);
  assert_eq!(WorkflowType::from_kind("pong"), WorkflowType::Unknown);
}

#[test]
fn build_initiators_from_args() -> Result<(), WorkflowError> {
  let ping = WorkflowFactory::build(WorkflowType::Ping, &json!({"peer": "bob"}))?;
  assert_eq!(ping.kind(), "ping");
  let payment = WorkflowFactory::build(WorkflowType::Payment,
                                       &json!({"payee": "bob", "amount": 10, "reference": "inv-1", "notary": "notary"}))?;
  match payment {
    AppFlow::Payment(p) => {
      assert_eq!(p.amount, 10);
      assert_eq!(p.notary.unwrap().as_str(), "notary");
    }
    other => panic!("unexpected {:?}", other),
  }
  let notarise = WorkflowFactory::build(WorkflowType::Notarise,
                                        &json!({"notary": "n", "tx_id": "tx-1", "state_refs": ["coin-1"]}))?;
  assert_eq!(notarise.kind(), "notary-client");
  Ok(())
}

#[test]
fn invalid_args_are_rejected() {
  assert!(matches!(WorkflowFactory::build(WorkflowType::Ping, &json!({"peer": "bob", "rounds": 0})),
                   Err(WorkflowError::Validation(_))));
  assert!(matches!(WorkflowFactory::build(WorkflowType::Payment, &json!({"payee": "bob", "amount": 5})),
                   Err(WorkflowError::Serialization(_))));
  assert!(matches!(WorkflowFactory::build(WorkflowType::Payment,
                                          &json!({"payee": "bob", "amount": 0, "reference": "r"})),
                   Err(WorkflowError::Validation(_))));
  assert!(matches!(WorkflowFactory::build(WorkflowType::Notarise,
                                          &json!({"notary": "n", "tx_id": "t", "state_refs": []})),
                   Err(WorkflowError::Validation(_))));
  assert!(matches!(WorkflowFactory::build(WorkflowType::Unknown, &json!({})),
                   Err(WorkflowError::Validation(_))));
}

#[test]
fn responder_registry_pairs_initiators() {
  let session = flow::SessionId::derived(&flow::FlowId::new(), 0);
  assert_eq!(AppFlow::responder("ping", session).unwrap().kind(), "pong");
  assert_eq!(AppFlow::responder("payment", session).unwrap().kind(), "payment-responder");
  assert_eq!(AppFlow::responder("payment-responder", session).unwrap().kind(), "notary-service");
  assert_eq!(AppFlow::responder("notary-client", session).unwrap().kind(), "notary-service");
  assert!(AppFlow::responder("pong", session).is_none());
}
