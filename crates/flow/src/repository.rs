// Archivo: repository.rs
// Propósito: definir el trait `CheckpointStore`, el contrato que deben
// implementar las persistencias de checkpoints (SQLite, en memoria, etc.).
use crate::domain::{CheckpointRecord, FlowId, FlowStatus, PersistResult, StoredCheckpoint};
use crate::errors::Result;

/// Persistencia durable de checkpoints indexada por `FlowId`.
///
/// Cada fila guarda la etiqueta de estado, el blob serializado y una versión.
/// La escritura es atómica con semántica put-if-version: dos workers nunca
/// pueden confirmar checkpoints divergentes para el mismo flujo.
pub trait CheckpointStore: Send + Sync {
    /// Escribe el checkpoint si la versión actual es `expected_version`
    /// (0 = la fila no debe existir). Devuelve la nueva versión o
    /// `PersistResult::Conflict`.
    fn put(&self, flow_id: &FlowId, record: &CheckpointRecord, expected_version: i64) -> Result<PersistResult>;

    /// Lee la fila de un flujo, si existe.
    fn get(&self, flow_id: &FlowId) -> Result<Option<StoredCheckpoint>>;

    /// Elimina la fila de un flujo. No falla si no existe.
    fn delete(&self, flow_id: &FlowId) -> Result<()>;

    /// Flujos cuyo estado no es terminal (`Completed`/`Failed`).
    fn list_non_terminal(&self) -> Result<Vec<FlowId>>;

    /// Todos los flujos con su etiqueta de estado.
    fn list_flows(&self) -> Result<Vec<(FlowId, FlowStatus)>>;
}
