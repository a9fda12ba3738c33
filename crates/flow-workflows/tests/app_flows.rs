use flow::stubs::{FnVerifier, InMemoryCheckpointStore, InMemoryNetwork};
use flow::{CheckpointStore, FailureKind, FlowEngine, FlowEngineConfig, FlowId, FlowResult, FlowServices, NodeId,
           SessionId, Verdict};
use flow_persistence::DieselCheckpointStore;
use flow_workflows::{AppFlow, WorkflowFactory, WorkflowType};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;

fn config() -> FlowEngineConfig {
  FlowEngineConfig { base_backoff: Duration::from_millis(10),
                     max_backoff: Duration::from_millis(50),
                     sweep_interval: Duration::from_millis(20),
                     ..FlowEngineConfig::default() }
}

fn node(network: &Arc<InMemoryNetwork>,
        name: &str,
        store: Arc<dyn CheckpointStore>,
        services: FlowServices)
        -> FlowEngine<AppFlow> {
  let engine = FlowEngine::new(NodeId::new(name), store, Arc::new(network.transport()), services, config()).unwrap();
  network.attach(engine.router());
  engine
}

fn memory_node(network: &Arc<InMemoryNetwork>, name: &str) -> FlowEngine<AppFlow> {
  node(network, name, Arc::new(InMemoryCheckpointStore::new()), FlowServices::default())
}

/// Payee que rechaza importes por encima de 1000.
fn strict_payee(network: &Arc<InMemoryNetwork>, name: &str) -> FlowEngine<AppFlow> {
  let verifier = FnVerifier(|_contract: &str, inputs: &serde_json::Value| {
    if inputs["amount"].as_u64().unwrap_or(0) > 1000 {
      Verdict::Rejected("importe por encima del límite".into())
    } else {
      Verdict::Accepted
    }
  });
  node(network,
       name,
       Arc::new(InMemoryCheckpointStore::new()),
       FlowServices::default().with_verifier(Arc::new(verifier)))
}

async fn outcome(engine: &FlowEngine<AppFlow>, flow_id: FlowId) -> FlowResult {
  tokio::time::timeout(Duration::from_secs(10), engine.wait_for(flow_id)).await
                                                                        .expect("el flujo no terminó a tiempo")
                                                                        .expect("wait_for")
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn ping_workflow_round_trips() {
  let network = InMemoryNetwork::new();
  let alice = memory_node(&network, "alice");
  let bob = memory_node(&network, "bob");

  let id = WorkflowFactory::start(&alice, WorkflowType::Ping, &json!({"peer": "bob", "rounds": 2}), None).unwrap();
  assert_eq!(outcome(&alice, id).await, Ok(json!({"pongs": 2})));
  let responder = FlowId::for_responder(&SessionId::derived(&id, 0));
  assert_eq!(outcome(&bob, responder).await, Ok(json!({"served": 2})));

  let kinds = WorkflowFactory::flows_by_type(&alice).unwrap();
  assert_eq!(kinds.get(&id), Some(&WorkflowType::Ping));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn notarised_payment_and_double_spend() {
  let network = InMemoryNetwork::new();
  let alice = memory_node(&network, "alice");
  let _bob = strict_payee(&network, "bob");
  let _notary = memory_node(&network, "notary");

  let args = json!({"payee": "bob", "amount": 250, "reference": "coin-7", "notary": "notary"});
  let paid = WorkflowFactory::start(&alice, WorkflowType::Payment, &args, None).unwrap();
  let result = outcome(&alice, paid).await.expect("pago");
  assert_eq!(result["amount"], 250);
  assert!(result["tx_id"].as_str().unwrap().starts_with("tx-"));

  // la misma referencia no puede gastarse dos veces
  let again = WorkflowFactory::start(&alice, WorkflowType::Payment, &args, None).unwrap();
  let failure = outcome(&alice, again).await.unwrap_err();
  assert_eq!(failure.kind, FailureKind::CounterpartyRejected);
  assert!(failure.message.contains("coin-7"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn contract_rejection_reaches_the_payer() {
  let network = InMemoryNetwork::new();
  let alice = memory_node(&network, "alice");
  let _bob = strict_payee(&network, "bob");

  let args = json!({"payee": "bob", "amount": 5000, "reference": "inv-9"});
  let id = WorkflowFactory::start(&alice, WorkflowType::Payment, &args, None).unwrap();
  let failure = outcome(&alice, id).await.unwrap_err();
  assert_eq!(failure.kind, FailureKind::CounterpartyRejected);
  assert_eq!(failure.message, "importe por encima del límite");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn notary_client_is_idempotent_per_transaction() {
  let network = InMemoryNetwork::new();
  let alice = memory_node(&network, "alice");
  let _notary = memory_node(&network, "notary");

  let args = json!({"notary": "notary", "tx_id": "tx-1", "state_refs": ["coin-1", "coin-2"]});
  let first = WorkflowFactory::start(&alice, WorkflowType::Notarise, &args, None).unwrap();
  assert_eq!(outcome(&alice, first).await, Ok(json!({"tx_id": "tx-1", "committed": true})));
  let replay = WorkflowFactory::start(&alice, WorkflowType::Notarise, &args, None).unwrap();
  assert!(outcome(&alice, replay).await.is_ok());

  let clash = json!({"notary": "notary", "tx_id": "tx-2", "state_refs": ["coin-2"]});
  let other = WorkflowFactory::start(&alice, WorkflowType::Notarise, &clash, Some("clash-1")).unwrap();
  assert_eq!(WorkflowFactory::start(&alice, WorkflowType::Notarise, &clash, Some("clash-1")).unwrap(), other);
  let failure = outcome(&alice, other).await.unwrap_err();
  assert_eq!(failure.kind, FailureKind::CounterpartyRejected);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn sqlite_backed_node_recovers_after_restart() {
  let dir = tempfile::tempdir().unwrap();
  let db = dir.path().join("alice.db");
  let db = db.to_str().unwrap().to_string();
  let network = InMemoryNetwork::new();
  let bob = memory_node(&network, "bob");
  // bob sigue siendo resoluble pero no recibe nada hasta reconectarse
  network.detach(&NodeId::new("bob"));

  let alice = node(&network,
                   "alice",
                   Arc::new(DieselCheckpointStore::new(&db).unwrap()),
                   FlowServices::default());
  let id = WorkflowFactory::start(&alice, WorkflowType::Ping, &json!({"peer": "bob", "rounds": 2}), None).unwrap();
  let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
  while !matches!(alice.state_of(&id).unwrap(), Some(flow::FlowState::SuspendedSendAndReceive { .. })) {
    assert!(tokio::time::Instant::now() < deadline);
    tokio::time::sleep(Duration::from_millis(10)).await;
  }
  alice.shutdown();
  network.detach(&NodeId::new("alice"));
  drop(alice);

  network.attach(bob.router());
  let restarted = FlowEngine::<AppFlow>::new(NodeId::new("alice"),
                                             Arc::new(DieselCheckpointStore::new(&db).unwrap()),
                                             Arc::new(network.transport()),
                                             FlowServices::default(),
                                             config()).unwrap();
  // recuperar antes de reconectar: los pongs encolados llegan a un flujo ya residente
  assert_eq!(restarted.recover().unwrap(), 1);
  network.attach(restarted.router());
  assert_eq!(outcome(&restarted, id).await, Ok(json!({"pongs": 2})));
}
