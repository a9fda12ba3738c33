use flow::stubs::{InMemoryCheckpointStore, InMemoryNetwork};
use flow::{CheckpointStore, FlowEngine, FlowEngineConfig, FlowId, FlowServices, NodeId};
use flow_workflows::{AppFlow, WorkflowFactory, WorkflowType};
use serde_json::json;
use std::error::Error;
use std::sync::Arc;

/// Demo de tres nodos (alice, bob y un notario) sobre la red en memoria.
///
/// Escenarios:
/// 1) ping/pong de tres rondas entre alice y bob
/// 2) pago notarizado de alice a bob
/// 3) el mismo pago repetido: el notario detecta el doble gasto
/// 4) tabla de checkpoints de alice
///
/// Si `FLOW_DB_URL` (o `DATABASE_URL`) está definido, alice guarda sus
/// checkpoints en SQLite y recupera los flujos pendientes al arrancar.
#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    env_logger::init();
    let config = FlowEngineConfig::from_env()?;
    let network = InMemoryNetwork::new();

    let alice_store: Arc<dyn CheckpointStore> = match flow_persistence::new_from_env() {
        Ok(store) => {
            println!("alice: checkpoints en SQLite ({} filas previas)", store.count()?);
            Arc::new(store)
        }
        Err(e) => {
            log::info!("alice usa un store en memoria ({})", e);
            Arc::new(InMemoryCheckpointStore::new())
        }
    };
    let alice = start_node(&network, "alice", alice_store, &config)?;
    let bob = start_node(&network, "bob", Arc::new(InMemoryCheckpointStore::new()), &config)?;
    let notary = start_node(&network, "notary", Arc::new(InMemoryCheckpointStore::new()), &config)?;
    let recovered = alice.recover()?;
    if recovered > 0 {
        println!("alice: {} flujos recuperados", recovered);
    }

    let ping = WorkflowFactory::start(&alice, WorkflowType::Ping, &json!({"peer": "bob", "rounds": 3}), None)?;
    report(&alice, "ping", ping).await?;

    let payment = json!({"payee": "bob", "amount": 120, "reference": "coin-1", "notary": "notary"});
    let first = WorkflowFactory::start(&alice, WorkflowType::Payment, &payment, None)?;
    report(&alice, "pago", first).await?;
    let second = WorkflowFactory::start(&alice, WorkflowType::Payment, &payment, None)?;
    report(&alice, "pago repetido", second).await?;

    println!("\nFLOW_ID                              | STATUS       | VERSION | KIND");
    println!("-----------------------------------------------------------------------------");
    for dump in alice.dump_checkpoints()? {
        println!("{} | {:<12} | {:>7} | {}",
                 dump["flow_id"].as_str().unwrap_or("-"),
                 dump["status"].as_str().unwrap_or("-"),
                 dump["version"],
                 dump["checkpoint"]["flow_kind"].as_str().unwrap_or("-"));
    }
    let patients = alice.hospital().patients();
    if !patients.is_empty() {
        println!("en observación: {:?}", patients);
    }

    for engine in [&alice, &bob, &notary] {
        engine.shutdown();
    }
    Ok(())
}

fn start_node(network: &Arc<InMemoryNetwork>,
              name: &str,
              store: Arc<dyn CheckpointStore>,
              config: &FlowEngineConfig)
              -> Result<FlowEngine<AppFlow>, Box<dyn Error>> {
    let engine = FlowEngine::new(NodeId::new(name),
                                 store,
                                 Arc::new(network.transport()),
                                 FlowServices::default(),
                                 config.clone())?;
    network.attach(engine.router());
    Ok(engine)
}

async fn report(engine: &FlowEngine<AppFlow>, label: &str, flow_id: FlowId) -> Result<(), Box<dyn Error>> {
    match engine.wait_for(flow_id).await? {
        Ok(result) => println!("{} ({}): completado -> {}", label, flow_id, result),
        Err(failure) => println!("{} ({}): fallido [{}] {}", label, flow_id, failure.kind, failure.message),
    }
    Ok(())
}
