// Archivo: domain.rs
// Propósito: tipos de dominio compartidos por todo el crate: identificadores
// (`FlowId`, `SessionId`, `NodeId`), el estado etiquetado `FlowState`, la
// etiqueta de estado persistida `FlowStatus` y los registros que intercambia
// el `CheckpointStore`.
use crate::errors::FlowFailure;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Deriva un `Uuid` determinista a partir de las partes dadas (blake3).
///
/// Se usa para que una re-ejecución del mismo paso produzca exactamente los
/// mismos identificadores.
pub fn derive_uuid(parts: &[&[u8]]) -> Uuid {
    let mut hasher = blake3::Hasher::new();
    for p in parts {
        hasher.update(&(p.len() as u64).to_le_bytes());
        hasher.update(p);
    }
    let digest = hasher.finalize();
    let mut bytes = [0u8; 16];
    bytes.copy_from_slice(&digest.as_bytes()[..16]);
    uuid::Builder::from_random_bytes(bytes).into_uuid()
}

/// Identificador global de una instancia de flujo. Inmutable durante toda
/// su vida.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FlowId(pub Uuid);

impl FlowId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// FlowId asociado a un client id: dos arranques con el mismo client id
    /// apuntan al mismo flujo.
    pub fn for_client_id(client_id: &str) -> Self {
        Self(derive_uuid(&[b"client", client_id.as_bytes()]))
    }

    /// FlowId del responder creado por un `Open` de la sesión dada.
    pub fn for_responder(session: &SessionId) -> Self {
        Self(derive_uuid(&[b"responder", session.0.as_bytes()]))
    }
}

impl Default for FlowId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for FlowId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for FlowId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self(Uuid::parse_str(s)?))
    }
}

/// Identificador de sesión compartido por ambos extremos.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(pub Uuid);

impl SessionId {
    /// Sesión derivada del flujo iniciador y de un contador persistido en su
    /// checkpoint.
    pub fn derived(flow_id: &FlowId, nonce: u64) -> Self {
        Self(derive_uuid(&[b"session", flow_id.0.as_bytes(), &nonce.to_le_bytes()]))
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Nombre lógico de un nodo de la red.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeId(pub String);

impl NodeId {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Estado de un flujo. Exactamente uno se cumple en cada instante y sólo las
/// transiciones de `FlowMachine` lo cambian.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum FlowState {
    Runnable,
    SuspendedSendAndReceive { session: SessionId, expected: String },
    SuspendedSend { session: SessionId },
    SuspendedReceive { session: SessionId, expected: String },
    Completed { result: JsonValue },
    Failed { error: FlowFailure },
    Hospitalized { reason: FlowFailure },
}

impl FlowState {
    pub fn status(&self) -> FlowStatus {
        match self {
            FlowState::Runnable => FlowStatus::Runnable,
            FlowState::SuspendedSendAndReceive { .. }
            | FlowState::SuspendedSend { .. }
            | FlowState::SuspendedReceive { .. } => FlowStatus::Suspended,
            FlowState::Completed { .. } => FlowStatus::Completed,
            FlowState::Failed { .. } => FlowStatus::Failed,
            FlowState::Hospitalized { .. } => FlowStatus::Hospitalized,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status().is_terminal()
    }

    /// Sesión de la que el flujo espera un mensaje, si está suspendido en
    /// una recepción.
    pub fn awaiting(&self) -> Option<SessionId> {
        match self {
            FlowState::SuspendedSendAndReceive { session, .. } | FlowState::SuspendedReceive { session, .. } => {
                Some(*session)
            }
            _ => None,
        }
    }

    /// Resultado terminal, si lo hay.
    pub fn outcome(&self) -> Option<FlowResult> {
        match self {
            FlowState::Completed { result } => Some(Ok(result.clone())),
            FlowState::Failed { error } => Some(Err(error.clone())),
            _ => None,
        }
    }
}

/// Resultado que recibe el iniciador cuando el flujo alcanza un estado
/// terminal.
pub type FlowResult = std::result::Result<JsonValue, FlowFailure>;

/// Etiqueta de estado guardada junto a cada fila del `CheckpointStore`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FlowStatus {
    Runnable,
    Suspended,
    Completed,
    Failed,
    Hospitalized,
}

impl FlowStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, FlowStatus::Completed | FlowStatus::Failed)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            FlowStatus::Runnable => "runnable",
            FlowStatus::Suspended => "suspended",
            FlowStatus::Completed => "completed",
            FlowStatus::Failed => "failed",
            FlowStatus::Hospitalized => "hospitalized",
        }
    }
}

impl fmt::Display for FlowStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for FlowStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "runnable" => Ok(FlowStatus::Runnable),
            "suspended" => Ok(FlowStatus::Suspended),
            "completed" => Ok(FlowStatus::Completed),
            "failed" => Ok(FlowStatus::Failed),
            "hospitalized" => Ok(FlowStatus::Hospitalized),
            other => Err(format!("estado desconocido: {}", other)),
        }
    }
}

/// Resultado de una escritura con control optimista de versión.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PersistResult {
    Ok { new_version: i64 },
    Conflict,
}

/// Fila lógica que se entrega al `CheckpointStore`: etiqueta de estado,
/// blob serializado y su checksum.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckpointRecord {
    pub status: FlowStatus,
    pub payload: Vec<u8>,
    pub checksum: String,
    pub client_id: Option<String>,
}

/// Fila tal como la devuelve el `CheckpointStore`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredCheckpoint {
    pub flow_id: FlowId,
    pub record: CheckpointRecord,
    pub version: i64,
    pub updated_at: DateTime<Utc>,
}
