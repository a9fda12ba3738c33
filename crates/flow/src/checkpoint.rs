// Archivo: checkpoint.rs
// Propósito: snapshot durable de un flujo (`Checkpoint`) y su codificación
// hacia/desde el `CheckpointStore`: JSON + checksum blake3, con escritura
// put-if-version.
use crate::domain::{CheckpointRecord, FlowId, FlowState, FlowStatus, NodeId, PersistResult, SessionId, StoredCheckpoint};
use crate::errors::{FlowError, Result};
use crate::repository::CheckpointStore;
use crate::session::{Envelope, Role, Session};
use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::sync::Arc;

/// Todo lo necesario para reconstruir un flujo tras un reinicio: estado,
/// variables locales de la lógica, tabla de sesiones (en orden de
/// creación) y mensajes salientes aún no confirmados por el transporte.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Checkpoint<L> {
    pub flow_id: FlowId,
    pub flow_kind: String,
    pub our_node: NodeId,
    pub state: FlowState,
    pub sessions: IndexMap<SessionId, Session>,
    pub logic: L,
    pub outbox: Vec<Envelope>,
    /// Número de suspensiones confirmadas; identifica el paso actual.
    pub suspend_count: u64,
    /// Contador para derivar ids de sesión deterministas.
    pub nonce: u64,
    pub client_id: Option<String>,
    /// Estado previo a la hospitalización, para reanudar desde ahí.
    pub resume_state: Option<FlowState>,
    /// Momento en que el flujo empezó a esperar su mensaje actual.
    #[serde(default)]
    pub suspended_at: Option<DateTime<Utc>>,
}

impl<L> Checkpoint<L> {
    pub fn new(flow_id: FlowId, flow_kind: &str, our_node: NodeId, logic: L, client_id: Option<String>) -> Self {
        Self { flow_id,
               flow_kind: flow_kind.to_string(),
               our_node,
               state: FlowState::Runnable,
               sessions: IndexMap::new(),
               logic,
               outbox: Vec::new(),
               suspend_count: 0,
               nonce: 0,
               client_id,
               resume_state: None,
               suspended_at: None }
    }

    /// Extremos de sesión que posee el flujo, con su marca de cerrado.
    pub fn endpoints(&self) -> Vec<(SessionId, Role, bool)> {
        self.sessions
            .values()
            .map(|s| (s.id, s.role, s.is_closed()))
            .collect()
    }

    pub fn holds(&self, session: &SessionId, role: Role) -> bool {
        self.sessions.get(session).map(|s| s.role == role).unwrap_or(false)
    }
}

fn checksum(bytes: &[u8]) -> String {
    blake3::hash(bytes).to_hex().to_string()
}

/// Adaptador entre `Checkpoint` y el `CheckpointStore` inyectado.
#[derive(Clone)]
pub struct CheckpointStorage {
    store: Arc<dyn CheckpointStore>,
}

impl CheckpointStorage {
    pub fn new(store: Arc<dyn CheckpointStore>) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &Arc<dyn CheckpointStore> {
        &self.store
    }

    pub fn encode<L: Serialize>(checkpoint: &Checkpoint<L>) -> Result<CheckpointRecord> {
        let payload = serde_json::to_vec(checkpoint)?;
        Ok(CheckpointRecord { status: checkpoint.state.status(),
                              checksum: checksum(&payload),
                              payload,
                              client_id: checkpoint.client_id.clone() })
    }

    fn verify(stored: &StoredCheckpoint) -> Result<()> {
        if checksum(&stored.record.payload) != stored.record.checksum {
            return Err(FlowError::Corrupt(format!("checksum no coincide para el flujo {}", stored.flow_id)));
        }
        Ok(())
    }

    pub fn decode<L: DeserializeOwned>(stored: &StoredCheckpoint) -> Result<Checkpoint<L>> {
        Self::verify(stored)?;
        Ok(serde_json::from_slice(&stored.record.payload)?)
    }

    /// Escribe el checkpoint si la versión actual coincide con `expected`.
    /// Devuelve la nueva versión; una carrera perdida es `FlowError::Conflict`.
    pub fn commit<L: Serialize>(&self, checkpoint: &Checkpoint<L>, expected: i64) -> Result<i64> {
        let record = Self::encode(checkpoint)?;
        match self.store.put(&checkpoint.flow_id, &record, expected)? {
            PersistResult::Ok { new_version } => {
                log::trace!("checkpoint {} v{} ({})", checkpoint.flow_id, new_version, record.status);
                Ok(new_version)
            }
            PersistResult::Conflict => Err(FlowError::Conflict(format!("versión {} obsoleta para el flujo {}",
                                                                       expected, checkpoint.flow_id))),
        }
    }

    pub fn load<L: DeserializeOwned>(&self, flow_id: &FlowId) -> Result<Option<(Checkpoint<L>, i64)>> {
        match self.store.get(flow_id)? {
            Some(stored) => Ok(Some((Self::decode(&stored)?, stored.version))),
            None => Ok(None),
        }
    }

    /// Vista JSON genérica del checkpoint, sin conocer el tipo de la lógica.
    pub fn dump(&self, flow_id: &FlowId) -> Result<Option<JsonValue>> {
        let Some(stored) = self.store.get(flow_id)? else {
            return Ok(None);
        };
        Self::verify(&stored)?;
        let body: JsonValue = serde_json::from_slice(&stored.record.payload)?;
        Ok(Some(serde_json::json!({
            "flow_id": stored.flow_id,
            "status": stored.record.status,
            "version": stored.version,
            "updated_at": stored.updated_at,
            "checkpoint": body,
        })))
    }

    pub fn remove(&self, flow_id: &FlowId) -> Result<()> {
        self.store.delete(flow_id)
    }

    pub fn get(&self, flow_id: &FlowId) -> Result<Option<StoredCheckpoint>> {
        self.store.get(flow_id)
    }

    pub fn list_non_terminal(&self) -> Result<Vec<FlowId>> {
        self.store.list_non_terminal()
    }

    pub fn list_flows(&self) -> Result<Vec<(FlowId, FlowStatus)>> {
        self.store.list_flows()
    }
}
