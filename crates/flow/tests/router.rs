use flow::{Envelope, FailureKind, FlowFailure, FlowId, MessageKind, MessageRouter, NodeId, Role, RouteOutcome,
           RouterConfig, RouterEvent, SessionId, SessionMessage};
use std::time::{Duration, Instant};

fn envelope(session: SessionId, seq: u64, kind: MessageKind) -> Envelope {
  Envelope::new(NodeId::new("alice"),
                NodeId::new("bob"),
                FlowId::new(),
                SessionMessage { session,
                                 from: Role::Initiator,
                                 seq,
                                 kind })
}

fn data(session: SessionId, seq: u64) -> Envelope {
  envelope(session, seq, MessageKind::Data { payload: vec![seq as u8] })
}

fn router(max_pending: usize) -> (MessageRouter, tokio::sync::mpsc::UnboundedReceiver<RouterEvent>) {
  MessageRouter::new(NodeId::new("bob"),
                     RouterConfig { max_pending,
                                    pending_timeout: Duration::from_millis(100) })
}

#[test]
fn registered_endpoint_gets_mail() {
  let (r, mut events) = router(8);
  let session = SessionId::derived(&FlowId::new(), 0);
  let flow = FlowId::new();
  r.register(flow, session, Role::Responder);
  assert_eq!(r.route(data(session, 1)), RouteOutcome::Delivered(flow));
  assert!(matches!(tokio_test::block_on(events.recv()), Some(RouterEvent::Deliver(id)) if id == flow));
  assert_eq!(r.take_mail(&flow).map(|e| e.message.seq), Some(1));
  assert!(!r.has_mail(&flow));
}

#[test]
fn open_requests_session_init() {
  let (r, mut events) = router(8);
  let session = SessionId::derived(&FlowId::new(), 0);
  let open = envelope(session,
                      0,
                      MessageKind::Open { initiator_flow: FlowId::new(),
                                          flow_kind: "pinger".into() });
  assert_eq!(r.route(open), RouteOutcome::Initiating);
  assert!(matches!(events.try_recv(), Ok(RouterEvent::SessionInit(_))));
}

#[test]
fn unknown_endpoint_is_buffered_until_registered() {
  let (r, mut events) = router(8);
  let session = SessionId::derived(&FlowId::new(), 0);
  assert_eq!(r.route(data(session, 2)), RouteOutcome::Buffered);
  assert_eq!(r.route(data(session, 1)), RouteOutcome::Buffered);
  assert!(matches!(events.try_recv(), Ok(RouterEvent::Hydrate(s, Role::Responder)) if s == session));
  assert_eq!(r.pending_len(), 2);

  let flow = FlowId::new();
  r.register(flow, session, Role::Responder);
  assert_eq!(r.pending_len(), 0);
  let mut seqs = Vec::new();
  while let Some(e) = r.take_mail(&flow) {
    seqs.push(e.message.seq);
  }
  assert_eq!(seqs, vec![2, 1]);
}

#[test]
fn expired_and_evicted_messages_are_returned() {
  let (r, _events) = router(2);
  let session = SessionId::derived(&FlowId::new(), 0);
  let t0 = Instant::now();
  r.route_at(data(session, 1), t0);
  r.route_at(data(session, 2), t0);
  // al desbordar se descarta el más antiguo
  r.route_at(data(session, 3), t0 + Duration::from_millis(80));
  assert_eq!(r.pending_len(), 2);

  let first = r.expire(t0 + Duration::from_millis(50));
  assert_eq!(first.iter().map(|e| e.message.seq).collect::<Vec<_>>(), vec![1]);

  let second = r.expire(t0 + Duration::from_millis(150));
  assert_eq!(second.iter().map(|e| e.message.seq).collect::<Vec<_>>(), vec![2]);
  assert_eq!(r.pending_len(), 1);
}

#[test]
fn abort_reply_targets_the_sender_endpoint() {
  let session = SessionId::derived(&FlowId::new(), 0);
  let original = data(session, 4);
  let reply = original.abort_reply(&NodeId::new("bob"), FlowFailure::timeout("late"));
  assert_eq!(reply.recipient, NodeId::new("alice"));
  assert_eq!(reply.endpoint(), (session, Role::Initiator));
  match reply.message.kind {
    MessageKind::Abort { failure } => assert_eq!(failure.kind, FailureKind::SessionTimeout),
    other => panic!("unexpected {:?}", other),
  }
}
