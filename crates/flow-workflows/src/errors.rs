use thiserror::Error;

// Errores de la capa de workflows.
//
// Los fallos durante la ejecución de un flujo viajan como `FlowFailure`
// dentro del motor; este enum cubre lo que ocurre antes y alrededor:
// construir un flujo desde argumentos, arrancarlo y consultar el motor.
#[derive(Error, Debug)]
pub enum WorkflowError {
  /// Errores originados por el motor o la persistencia (crate `flow`).
  #[error("Error de flujo: {0}")]
  Flow(#[from] flow::FlowError),

  /// Errores de serializacion/deserializacion JSON de los argumentos.
  #[error("Error de serializacion: {0}")]
  Serialization(#[from] serde_json::Error),

  /// Argumentos válidos en forma pero no en contenido (importe cero,
  /// rondas cero, referencias vacías).
  #[error("Error de validacion: {0}")]
  Validation(String),
}
