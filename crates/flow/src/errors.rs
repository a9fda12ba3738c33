// Archivo: errors.rs
// Propósito: definir los errores del framework, el alias Result<T> usado por
// las APIs del crate y la taxonomía de fallos de flujo que decide el hospital.
use crate::domain::NodeId;
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Errores comunes del framework de flujos.
///
/// - `NotFound`: entidad no encontrada (flow, checkpoint, sesión).
/// - `Conflict`: conflicto de concurrencia o versión esperada.
/// - `Storage`: error al acceder al almacenamiento externo.
/// - `Serialization`: error de (de)serialización JSON.
/// - `Corrupt`: checkpoint cuyo checksum no coincide.
/// - `CounterpartyUnreachable`: el transporte no resuelve el nodo destino.
/// - `InvalidTransition`: operación no permitida en el estado actual.
/// - `Other`: cualquier otro error.
#[derive(Error, Debug)]
pub enum FlowError {
    /// Entidad no encontrada.
    #[error("No encontrado: {0}")]
    NotFound(String),
    /// Conflicto optimista (version/expected mismatch).
    #[error("Conflicto: {0}")]
    Conflict(String),
    /// Error genérico de almacenamiento (BD, disco, etc.).
    #[error("Error de almacenamiento: {0}")]
    Storage(String),
    /// Error de serialización del snapshot o de un payload.
    #[error("Error de serialización: {0}")]
    Serialization(#[from] serde_json::Error),
    /// El blob persistido no corresponde a su checksum.
    #[error("Checkpoint corrupto: {0}")]
    Corrupt(String),
    /// El transporte no puede resolver el nodo contraparte.
    #[error("Contraparte inalcanzable: {0}")]
    CounterpartyUnreachable(NodeId),
    /// Transición de estado no permitida.
    #[error("Transición inválida: {0}")]
    InvalidTransition(String),
    /// Otro tipo de error.
    #[error("Otro: {0}")]
    Other(String),
}

/// Alias de resultado usado por las APIs del crate.
pub type Result<T> = std::result::Result<T, FlowError>;

/// Clase de fallo de un flujo. El hospital decide la disposición por clase,
/// nunca por el tipo concreto del error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// Red, timeout de infraestructura o almacenamiento: reintentable.
    TransientInfrastructure,
    /// Rechazo explícito de negocio: terminal.
    CounterpartyRejected,
    /// El par o un mensaje nunca llegó dentro del plazo.
    SessionTimeout,
    /// Error inesperado en el código del flujo: nunca se reintenta solo.
    InternalLogicFault,
    /// Cancelación externa explícita.
    Cancelled,
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            FailureKind::TransientInfrastructure => "transient-infrastructure",
            FailureKind::CounterpartyRejected => "counterparty-rejected",
            FailureKind::SessionTimeout => "session-timeout",
            FailureKind::InternalLogicFault => "internal-logic-fault",
            FailureKind::Cancelled => "cancelled",
        };
        write!(f, "{}", s)
    }
}

/// Fallo serializable de un flujo. Se guarda en el checkpoint, viaja en los
/// mensajes de control `Error`/`Abort` y es lo que recibe el iniciador cuando
/// el flujo termina en `Failed`.
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[error("{kind}: {message}")]
pub struct FlowFailure {
    pub kind: FailureKind,
    pub message: String,
}

impl FlowFailure {
    pub fn new(kind: FailureKind, message: impl Into<String>) -> Self {
        Self { kind,
               message: message.into() }
    }

    pub fn transient(message: impl Into<String>) -> Self {
        Self::new(FailureKind::TransientInfrastructure, message)
    }

    pub fn rejected(message: impl Into<String>) -> Self {
        Self::new(FailureKind::CounterpartyRejected, message)
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(FailureKind::SessionTimeout, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(FailureKind::InternalLogicFault, message)
    }

    pub fn cancelled(message: impl Into<String>) -> Self {
        Self::new(FailureKind::Cancelled, message)
    }
}

impl From<FlowError> for FlowFailure {
    /// Clasifica un error del framework dentro de la taxonomía de fallos.
    fn from(e: FlowError) -> Self {
        match e {
            FlowError::Storage(_) | FlowError::Conflict(_) | FlowError::CounterpartyUnreachable(_) => {
                FlowFailure::transient(e.to_string())
            }
            FlowError::Serialization(_)
            | FlowError::Corrupt(_)
            | FlowError::InvalidTransition(_)
            | FlowError::NotFound(_)
            | FlowError::Other(_) => FlowFailure::internal(e.to_string()),
        }
    }
}
