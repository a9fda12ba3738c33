use super::unexpected;
use crate::messages::{AppMessage, NotaryVerdict};
use flow::{FlowContext, FlowFailure, NodeId, Received, SessionId, Transition};
use serde::{Deserialize, Serialize};
use serde_json::json;

/// Pide al notario que finalice una transacción.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotaryClientFlow {
  pub notary: NodeId,
  pub tx_id: String,
  pub state_refs: Vec<String>,
  session: Option<SessionId>,
}

impl NotaryClientFlow {
  pub fn new(notary: NodeId, tx_id: impl Into<String>, state_refs: Vec<String>) -> Self {
    NotaryClientFlow { notary,
                       tx_id: tx_id.into(),
                       state_refs,
                       session: None }
  }

  pub(crate) fn step(&mut self, ctx: &mut FlowContext<'_, AppMessage>) -> Result<Transition, FlowFailure> {
    let Some(s) = self.session else {
      let s = ctx.initiate(&self.notary)?;
      self.session = Some(s);
      let request = AppMessage::NotariseRequest { tx_id: self.tx_id.clone(),
                                                  state_refs: self.state_refs.clone() };
      return ctx.send_and_receive(s, &request, "notarise_response");
    };
    match ctx.receive(s, "notarise_response")? {
      Received::Message(AppMessage::NotariseResponse { verdict: NotaryVerdict::Committed }) => {
        ctx.close(s)?;
        Ok(Transition::Complete(json!({ "tx_id": self.tx_id, "committed": true })))
      }
      Received::Message(AppMessage::NotariseResponse { verdict: NotaryVerdict::Conflict(refs) }) => {
        Err(FlowFailure::rejected(format!("conflicto en {}", refs.join(", "))))
      }
      Received::Message(other) => Err(unexpected(&other)),
      Received::Suspend(wait) => Ok(Transition::Suspend(wait)),
    }
  }
}

/// Servicio de notario: consulta al `UniquenessProvider` del nodo y
/// devuelve el veredicto. Reenviar la misma transacción es idempotente.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotaryServiceFlow {
  session: SessionId,
}

impl NotaryServiceFlow {
  pub fn new(session: SessionId) -> Self {
    NotaryServiceFlow { session }
  }

  pub(crate) fn step(&mut self, ctx: &mut FlowContext<'_, AppMessage>) -> Result<Transition, FlowFailure> {
    match ctx.receive(self.session, "notarise_request")? {
      Received::Message(AppMessage::NotariseRequest { tx_id, state_refs }) => {
        let verdict = NotaryVerdict::from(ctx.services().uniqueness.commit(&tx_id, &state_refs));
        let committed = verdict == NotaryVerdict::Committed;
        if !committed {
          log::info!("notario: {} rechazada por conflicto", tx_id);
        }
        ctx.send(self.session, &AppMessage::NotariseResponse { verdict })?;
        Ok(Transition::Complete(json!({ "tx_id": tx_id, "committed": committed })))
      }
      Received::Message(other) => Err(unexpected(&other)),
      Received::Suspend(wait) => Ok(Transition::Suspend(wait)),
    }
  }
}
