#![allow(dead_code)]

use flow::stubs::{InMemoryCheckpointStore, InMemoryNetwork};
use flow::{CheckpointRecord, CheckpointStore, FlowContext, FlowEngine, FlowEngineConfig, FlowError, FlowFailure,
           FlowId, FlowLogic, FlowResult, FlowServices, FlowStatus, NodeId, PersistResult, Received, SessionId,
           StoredCheckpoint, Suspend, Transition, Typed};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum TestMsg {
  Ping { n: u32, last: bool },
  Pong { n: u32 },
  Ask { amount: u64 },
  Ack,
}

impl Typed for TestMsg {
  fn type_name(&self) -> &'static str {
    match self {
      TestMsg::Ping { .. } => "ping",
      TestMsg::Pong { .. } => "pong",
      TestMsg::Ask { .. } => "ask",
      TestMsg::Ack => "ack",
    }
  }
}

fn gates() -> &'static Mutex<Vec<String>> {
  static GATES: OnceLock<Mutex<Vec<String>>> = OnceLock::new();
  GATES.get_or_init(|| Mutex::new(Vec::new()))
}

pub fn open_gate(key: &str) {
  gates().lock().unwrap().push(key.to_string());
}

fn gate_is_open(key: &str) -> bool {
  gates().lock().unwrap().iter().any(|k| k == key)
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum TestFlow {
  /// Sends `rounds` pings, one per round trip.
  Pinger { peer: NodeId, rounds: u32, done: u32, session: Option<SessionId>, awaiting: bool },
  /// Answers every ping until the last one.
  Ponger { session: SessionId, served: u32 },
  /// Asks the peer to accept a payment.
  Asker { peer: NodeId, amount: u64, session: Option<SessionId> },
  /// Verifies the payment before acknowledging it.
  Checker { session: SessionId },
  /// Opens a session and waits for a single pong without sending anything.
  Waiter { peer: NodeId, session: Option<SessionId> },
  /// Opens a session to a node that has no responder for it.
  Orphan { peer: NodeId, session: Option<SessionId> },
  Panicky,
  Spinner,
  /// Fails with an internal fault until its gate is opened.
  Gate { key: String },
  /// Like `Waiter`, but the pong is a fault until its gate is opened.
  GatedWaiter { peer: NodeId, key: String, session: Option<SessionId> },
}

impl TestFlow {
  pub fn pinger(peer: &str, rounds: u32) -> Self {
    TestFlow::Pinger { peer: NodeId::new(peer),
                       rounds,
                       done: 0,
                       session: None,
                       awaiting: false }
  }

  pub fn asker(peer: &str, amount: u64) -> Self {
    TestFlow::Asker { peer: NodeId::new(peer),
                      amount,
                      session: None }
  }

  pub fn waiter(peer: &str) -> Self {
    TestFlow::Waiter { peer: NodeId::new(peer),
                       session: None }
  }

  pub fn gated_waiter(peer: &str, key: &str) -> Self {
    TestFlow::GatedWaiter { peer: NodeId::new(peer),
                            key: key.to_string(),
                            session: None }
  }

  pub fn orphan(peer: &str) -> Self {
    TestFlow::Orphan { peer: NodeId::new(peer),
                       session: None }
  }
}

fn unexpected(m: &TestMsg) -> FlowFailure {
  FlowFailure::internal(format!("unexpected message {:?}", m))
}

impl FlowLogic for TestFlow {
  type Message = TestMsg;

  fn kind(&self) -> &'static str {
    match self {
      TestFlow::Pinger { .. } => "pinger",
      TestFlow::Ponger { .. } => "ponger",
      TestFlow::Asker { .. } => "asker",
      TestFlow::Checker { .. } => "checker",
      TestFlow::Waiter { .. } => "waiter",
      TestFlow::Orphan { .. } => "orphan",
      TestFlow::Panicky => "panicky",
      TestFlow::Spinner => "spinner",
      TestFlow::Gate { .. } => "gate",
      TestFlow::GatedWaiter { .. } => "gated-waiter",
    }
  }

  fn step(&mut self, ctx: &mut FlowContext<'_, TestMsg>) -> Result<Transition, FlowFailure> {
    match self {
      TestFlow::Pinger { peer,
                         rounds,
                         done,
                         session,
                         awaiting, } => {
        let s = match session {
          Some(s) => *s,
          None => {
            let s = ctx.initiate(peer)?;
            *session = Some(s);
            s
          }
        };
        if *awaiting {
          match ctx.receive(s, "pong")? {
            Received::Message(TestMsg::Pong { n }) if n == *done => {
              *done += 1;
              *awaiting = false;
            }
            Received::Message(other) => return Err(unexpected(&other)),
            Received::Suspend(wait) => return Ok(Transition::Suspend(wait)),
          }
        }
        if *done == *rounds {
          ctx.close(s)?;
          return Ok(Transition::Complete(json!({ "pongs": *done })));
        }
        *awaiting = true;
        ctx.send_and_receive(s, &TestMsg::Ping { n: *done, last: *done + 1 == *rounds }, "pong")
      }
      TestFlow::Ponger { session, served } => loop {
        match ctx.receive(*session, "ping")? {
          Received::Message(TestMsg::Ping { n, last }) => {
            ctx.send(*session, &TestMsg::Pong { n })?;
            *served += 1;
            if last {
              return Ok(Transition::Complete(json!({ "served": *served })));
            }
          }
          Received::Message(other) => return Err(unexpected(&other)),
          Received::Suspend(wait) => return Ok(Transition::Suspend(wait)),
        }
      },
      TestFlow::Asker { peer, amount, session } => match session {
        None => {
          let s = ctx.initiate(peer)?;
          *session = Some(s);
          ctx.send_and_receive(s, &TestMsg::Ask { amount: *amount }, "ack")
        }
        Some(s) => match ctx.receive(*s, "ack")? {
          Received::Message(TestMsg::Ack) => Ok(Transition::Complete(json!({ "paid": *amount }))),
          Received::Message(other) => Err(unexpected(&other)),
          Received::Suspend(wait) => Ok(Transition::Suspend(wait)),
        },
      },
      TestFlow::Checker { session } => match ctx.receive(*session, "ask")? {
        Received::Message(TestMsg::Ask { amount }) => {
          ctx.verify("payment", &json!({ "amount": amount }))?;
          ctx.send(*session, &TestMsg::Ack)?;
          Ok(Transition::Complete(json!({ "accepted": amount })))
        }
        Received::Message(other) => Err(unexpected(&other)),
        Received::Suspend(wait) => Ok(Transition::Suspend(wait)),
      },
      TestFlow::Waiter { peer, session } => match session {
        None => {
          let s = ctx.initiate(peer)?;
          *session = Some(s);
          Ok(Transition::Suspend(Suspend::Receive { session: s,
                                                    expected: "pong" }))
        }
        Some(s) => match ctx.receive(*s, "pong")? {
          Received::Message(TestMsg::Pong { n }) => Ok(Transition::Complete(json!({ "pong": n }))),
          Received::Message(other) => Err(unexpected(&other)),
          Received::Suspend(wait) => Ok(Transition::Suspend(wait)),
        },
      },
      TestFlow::Orphan { peer, session } => match session {
        None => {
          let s = ctx.initiate(peer)?;
          *session = Some(s);
          ctx.send_and_receive(s, &TestMsg::Ping { n: 0, last: true }, "pong")
        }
        Some(s) => match ctx.receive(*s, "pong")? {
          Received::Message(_) => Ok(Transition::Complete(json!(null))),
          Received::Suspend(wait) => Ok(Transition::Suspend(wait)),
        },
      },
      TestFlow::Panicky => panic!("boom"),
      TestFlow::Spinner => Ok(Transition::Continue),
      TestFlow::Gate { key } => {
        if gate_is_open(key) {
          Ok(Transition::Complete(json!({ "gate": key.clone() })))
        } else {
          Err(FlowFailure::internal(format!("gate {} closed", key)))
        }
      }
      TestFlow::GatedWaiter { peer, key, session } => match session {
        None => {
          let s = ctx.initiate(peer)?;
          *session = Some(s);
          Ok(Transition::Suspend(Suspend::Receive { session: s,
                                                    expected: "pong" }))
        }
        Some(s) => match ctx.receive(*s, "pong")? {
          Received::Message(TestMsg::Pong { n }) if gate_is_open(key) => Ok(Transition::Complete(json!({ "pong": n }))),
          Received::Message(TestMsg::Pong { .. }) => Err(FlowFailure::internal(format!("gate {} closed", key))),
          Received::Message(other) => Err(unexpected(&other)),
          Received::Suspend(wait) => Ok(Transition::Suspend(wait)),
        },
      },
    }
  }

  fn responder(initiator_kind: &str, session: SessionId) -> Option<Self> {
    match initiator_kind {
      "pinger" | "waiter" | "gated-waiter" => Some(TestFlow::Ponger { session, served: 0 }),
      "asker" => Some(TestFlow::Checker { session }),
      _ => None,
    }
  }
}

/// Short timings so failure paths settle quickly in tests.
pub fn fast_config() -> FlowEngineConfig {
  FlowEngineConfig { base_backoff: Duration::from_millis(10),
                     max_backoff: Duration::from_millis(50),
                     sweep_interval: Duration::from_millis(20),
                     pending_timeout: Duration::from_millis(400),
                     ..FlowEngineConfig::default() }
}

pub fn node(network: &Arc<InMemoryNetwork>,
            name: &str,
            store: Arc<dyn CheckpointStore>,
            services: FlowServices,
            config: FlowEngineConfig)
            -> FlowEngine<TestFlow> {
  let engine = FlowEngine::new(NodeId::new(name), store, Arc::new(network.transport()), services, config).expect("engine");
  network.attach(engine.router());
  engine
}

pub fn simple_node(network: &Arc<InMemoryNetwork>, name: &str) -> (FlowEngine<TestFlow>, Arc<InMemoryCheckpointStore>) {
  let store = Arc::new(InMemoryCheckpointStore::new());
  let engine = node(network, name, store.clone(), FlowServices::default(), fast_config());
  (engine, store)
}

pub async fn outcome(engine: &FlowEngine<TestFlow>, flow_id: FlowId) -> FlowResult {
  tokio::time::timeout(Duration::from_secs(10), engine.wait_for(flow_id)).await
                                                                        .expect("flow did not finish in time")
                                                                        .expect("wait_for")
}

/// Polls `cond` until it holds or the deadline passes.
pub async fn eventually(mut cond: impl FnMut() -> bool) {
  let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
  while !cond() {
    assert!(tokio::time::Instant::now() < deadline, "condition not reached in time");
    tokio::time::sleep(Duration::from_millis(10)).await;
  }
}

/// Store that accepts `allowed` writes and then fails every write, like a
/// process dying while writing its checkpoint.
pub struct FlakyStore {
  pub inner: Arc<InMemoryCheckpointStore>,
  allowed: AtomicUsize,
}

impl FlakyStore {
  pub fn failing_after(inner: Arc<InMemoryCheckpointStore>, allowed: usize) -> Self {
    Self { inner,
           allowed: AtomicUsize::new(allowed) }
  }
}

impl CheckpointStore for FlakyStore {
  fn put(&self, flow_id: &FlowId, record: &CheckpointRecord, expected_version: i64) -> flow::Result<PersistResult> {
    let left = self.allowed.load(Ordering::SeqCst);
    if left == 0 {
      return Err(FlowError::Storage("disk unavailable".into()));
    }
    self.allowed.store(left - 1, Ordering::SeqCst);
    self.inner.put(flow_id, record, expected_version)
  }

  fn get(&self, flow_id: &FlowId) -> flow::Result<Option<StoredCheckpoint>> {
    self.inner.get(flow_id)
  }

  fn delete(&self, flow_id: &FlowId) -> flow::Result<()> {
    self.inner.delete(flow_id)
  }

  fn list_non_terminal(&self) -> flow::Result<Vec<FlowId>> {
    self.inner.list_non_terminal()
  }

  fn list_flows(&self) -> flow::Result<Vec<(FlowId, FlowStatus)>> {
    self.inner.list_flows()
  }
}
