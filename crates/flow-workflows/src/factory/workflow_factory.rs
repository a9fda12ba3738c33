use crate::flows::{AppFlow, NotaryClientFlow, PaymentFlow, PingFlow};
use crate::workflow_type::WorkflowType;
use crate::WorkflowError;
use flow::{FlowEngine, FlowId, NodeId};
use serde::Deserialize;
use serde_json::Value as JsonValue;
use std::collections::HashMap;

#[derive(Debug, Deserialize)]
struct PingArgs {
  peer: String,
  #[serde(default = "one")]
  rounds: u32,
}

fn one() -> u32 {
  1
}

#[derive(Debug, Deserialize)]
struct PaymentArgs {
  payee: String,
  amount: u64,
  reference: String,
  #[serde(default)]
  notary: Option<String>,
}

#[derive(Debug, Deserialize)]
struct NotariseArgs {
  notary: String,
  tx_id: String,
  state_refs: Vec<String>,
}

/// Fábrica de flujos de aplicación.
///
/// Traduce un `WorkflowType` y sus argumentos JSON a un `AppFlow` listo
/// para arrancar, y ofrece atajos para arrancarlo en un `FlowEngine`.
pub struct WorkflowFactory;
impl WorkflowFactory {
  /// Construye el flujo iniciador de `workflow_type` a partir de `args`.
  ///
  /// - `ping`: `{"peer": "bob", "rounds": 3}`
  /// - `payment`: `{"payee": "bob", "amount": 10, "reference": "inv-1", "notary": "notary"}`
  /// - `notarise`: `{"notary": "notary", "tx_id": "tx-1", "state_refs": ["coin-1"]}`
  pub fn build(workflow_type: WorkflowType, args: &JsonValue) -> Result<AppFlow, WorkflowError> {
    match workflow_type {
      WorkflowType::Ping => {
        let a: PingArgs = serde_json::from_value(args.clone())?;
        if a.rounds == 0 {
          return Err(WorkflowError::Validation("rounds debe ser mayor que cero".into()));
        }
        Ok(AppFlow::Ping(PingFlow::new(NodeId::new(a.peer), a.rounds)))
      }
      WorkflowType::Payment => {
        let a: PaymentArgs = serde_json::from_value(args.clone())?;
        if a.amount == 0 {
          return Err(WorkflowError::Validation("amount debe ser mayor que cero".into()));
        }
        if a.reference.trim().is_empty() {
          return Err(WorkflowError::Validation("reference vacía".into()));
        }
        Ok(AppFlow::Payment(PaymentFlow::new(NodeId::new(a.payee),
                                             a.amount,
                                             a.reference,
                                             a.notary.map(NodeId::new))))
      }
      WorkflowType::Notarise => {
        let a: NotariseArgs = serde_json::from_value(args.clone())?;
        if a.state_refs.is_empty() {
          return Err(WorkflowError::Validation("state_refs vacío".into()));
        }
        Ok(AppFlow::NotaryClient(NotaryClientFlow::new(NodeId::new(a.notary), a.tx_id, a.state_refs)))
      }
      WorkflowType::Unknown => Err(WorkflowError::Validation("tipo de workflow desconocido".into())),
    }
  }

  /// Construye y arranca el flujo. Con `client_id` el arranque es
  /// idempotente: repetirlo devuelve el mismo `FlowId`.
  pub fn start(engine: &FlowEngine<AppFlow>,
               workflow_type: WorkflowType,
               args: &JsonValue,
               client_id: Option<&str>)
               -> Result<FlowId, WorkflowError> {
    let logic = Self::build(workflow_type, args)?;
    let flow_id = match client_id {
      Some(c) => engine.start_with_client_id(c, logic)?,
      None => engine.start(logic)?,
    };
    log::info!("workflow {} arrancado como {}", workflow_type, flow_id);
    Ok(flow_id)
  }

  /// Lista los flujos guardados en el nodo con su tipo de workflow. Los
  /// responders aparecen como `Unknown`.
  pub fn flows_by_type(engine: &FlowEngine<AppFlow>) -> Result<HashMap<FlowId, WorkflowType>, WorkflowError> {
    let mut out = HashMap::new();
    for dump in engine.dump_checkpoints()? {
      let Some(id) = dump["flow_id"].as_str().and_then(|s| s.parse::<FlowId>().ok()) else {
        continue;
      };
      let kind = dump["checkpoint"]["flow_kind"].as_str().unwrap_or_default();
      out.insert(id, WorkflowType::from_kind(kind));
    }
    Ok(out)
  }
}
