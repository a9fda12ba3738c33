use super::unexpected;
use crate::messages::AppMessage;
use flow::{FlowContext, FlowFailure, NodeId, Received, SessionId, Transition};
use serde::{Deserialize, Serialize};
use serde_json::json;

/// Envía `rounds` pings a `peer`, uno por ida y vuelta, y termina con el
/// número de pongs recibidos.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PingFlow {
  pub peer: NodeId,
  pub rounds: u32,
  done: u32,
  session: Option<SessionId>,
  awaiting: bool,
}

impl PingFlow {
  pub fn new(peer: NodeId, rounds: u32) -> Self {
    PingFlow { peer,
               rounds,
               done: 0,
               session: None,
               awaiting: false }
  }

  pub(crate) fn step(&mut self, ctx: &mut FlowContext<'_, AppMessage>) -> Result<Transition, FlowFailure> {
    let s = match self.session {
      Some(s) => s,
      None => {
        let s = ctx.initiate(&self.peer)?;
        self.session = Some(s);
        s
      }
    };
    if self.awaiting {
      match ctx.receive(s, "pong")? {
        Received::Message(AppMessage::Pong { n }) if n == self.done => {
          self.done += 1;
          self.awaiting = false;
        }
        Received::Message(other) => return Err(unexpected(&other)),
        Received::Suspend(wait) => return Ok(Transition::Suspend(wait)),
      }
    }
    if self.done == self.rounds {
      ctx.close(s)?;
      return Ok(Transition::Complete(json!({ "pongs": self.done })));
    }
    self.awaiting = true;
    let ping = AppMessage::Ping { n: self.done,
                                  last: self.done + 1 == self.rounds };
    ctx.send_and_receive(s, &ping, "pong")
  }
}

/// Responder de `PingFlow`: contesta cada ping hasta el último.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PongFlow {
  session: SessionId,
  served: u32,
}

impl PongFlow {
  pub fn new(session: SessionId) -> Self {
    PongFlow { session, served: 0 }
  }

  pub(crate) fn step(&mut self, ctx: &mut FlowContext<'_, AppMessage>) -> Result<Transition, FlowFailure> {
    loop {
      match ctx.receive(self.session, "ping")? {
        Received::Message(AppMessage::Ping { n, last }) => {
          ctx.send(self.session, &AppMessage::Pong { n })?;
          self.served += 1;
          if last {
            return Ok(Transition::Complete(json!({ "served": self.served })));
          }
        }
        Received::Message(other) => return Err(unexpected(&other)),
        Received::Suspend(wait) => return Ok(Transition::Suspend(wait)),
      }
    }
  }
}
