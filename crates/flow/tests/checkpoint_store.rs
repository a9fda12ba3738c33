use flow::stubs::InMemoryCheckpointStore;
use flow::{Checkpoint, CheckpointStorage, CheckpointStore, FlowError, FlowId, FlowState, FlowStatus, NodeId,
           PersistResult};
use std::sync::Arc;

fn sample(flow_id: FlowId) -> Checkpoint<Vec<u32>> {
  Checkpoint::new(flow_id, "sample", NodeId::new("alice"), vec![1, 2, 3], Some("client-7".into()))
}

#[test]
fn put_if_version_rejects_stale_writers() {
  let store = InMemoryCheckpointStore::new();
  let id = FlowId::new();
  let record = CheckpointStorage::encode(&sample(id)).unwrap();
  assert_eq!(store.put(&id, &record, 0).unwrap(), PersistResult::Ok { new_version: 1 });
  // second creation loses
  assert_eq!(store.put(&id, &record, 0).unwrap(), PersistResult::Conflict);
  assert_eq!(store.put(&id, &record, 1).unwrap(), PersistResult::Ok { new_version: 2 });
  assert_eq!(store.put(&id, &record, 1).unwrap(), PersistResult::Conflict);
  assert_eq!(store.get(&id).unwrap().unwrap().version, 2);
}

#[test]
fn listing_separates_terminal_flows() {
  let store = Arc::new(InMemoryCheckpointStore::new());
  let storage = CheckpointStorage::new(store.clone());
  let running = FlowId::new();
  let done = FlowId::new();
  storage.commit(&sample(running), 0).unwrap();
  let mut finished = sample(done);
  finished.state = FlowState::Completed { result: serde_json::json!(1) };
  storage.commit(&finished, 0).unwrap();

  assert_eq!(storage.list_non_terminal().unwrap(), vec![running]);
  let flows = storage.list_flows().unwrap();
  assert_eq!(flows.len(), 2);
  assert!(flows.contains(&(done, FlowStatus::Completed)));
  assert!(flows.contains(&(running, FlowStatus::Runnable)));

  storage.remove(&done).unwrap();
  storage.remove(&done).unwrap();
  assert_eq!(store.len(), 1);
}

#[test]
fn commit_conflict_maps_to_flow_error() {
  let storage = CheckpointStorage::new(Arc::new(InMemoryCheckpointStore::new()));
  let cp = sample(FlowId::new());
  assert_eq!(storage.commit(&cp, 0).unwrap(), 1);
  assert!(matches!(storage.commit(&cp, 0), Err(FlowError::Conflict(_))));
}

#[test]
fn load_roundtrips_and_detects_corruption() {
  let store = Arc::new(InMemoryCheckpointStore::new());
  let storage = CheckpointStorage::new(store.clone());
  let id = FlowId::new();
  storage.commit(&sample(id), 0).unwrap();
  let (cp, version) = storage.load::<Vec<u32>>(&id).unwrap().unwrap();
  assert_eq!(cp.logic, vec![1, 2, 3]);
  assert_eq!(cp.client_id.as_deref(), Some("client-7"));
  assert_eq!(version, 1);

  let mut record = store.get(&id).unwrap().unwrap().record;
  record.payload[0] ^= 0xff;
  store.put(&id, &record, 1).unwrap();
  assert!(matches!(storage.load::<Vec<u32>>(&id), Err(FlowError::Corrupt(_))));
  assert!(matches!(storage.dump(&id), Err(FlowError::Corrupt(_))));
}

#[test]
fn dump_exposes_status_and_body() {
  let storage = CheckpointStorage::new(Arc::new(InMemoryCheckpointStore::new()));
  let id = FlowId::new();
  storage.commit(&sample(id), 0).unwrap();
  let dump = storage.dump(&id).unwrap().unwrap();
  assert_eq!(dump["status"], "runnable");
  assert_eq!(dump["version"], 1);
  assert_eq!(dump["checkpoint"]["flow_kind"], "sample");
  assert!(storage.dump(&FlowId::new()).unwrap().is_none());
}
