// Archivo: hospital.rs
// Propósito: política de fallos de flujo. Clasifica cada fallo por clase,
// decide reintento con backoff, observación o terminación, y guarda el
// historial médico de cada flujo para el operador.
use crate::domain::FlowId;
use crate::errors::{FailureKind, FlowFailure};
use crate::machine::FailureReport;
use chrono::{DateTime, Utc};
use dashmap::{DashMap, DashSet};
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct HospitalConfig {
    pub max_retries: u32,
    pub base_backoff: Duration,
    pub max_backoff: Duration,
    pub retry_session_timeouts: bool,
}

impl Default for HospitalConfig {
    fn default() -> Self {
        Self { max_retries: 3,
               base_backoff: Duration::from_millis(100),
               max_backoff: Duration::from_secs(10),
               retry_session_timeouts: false }
    }
}

/// Disposición decidida para un fallo.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Diagnosis {
    /// Reintentar desde el último checkpoint tras `backoff`.
    Discharge { attempt: u32, backoff: Duration },
    /// Aparcar el flujo hasta que intervenga un operador.
    OvernightObservation,
    /// Terminar el flujo en `Failed`.
    Terminal,
}

/// Entrada del historial médico de un flujo.
#[derive(Debug, Clone)]
pub struct MedicalRecord {
    pub flow_id: FlowId,
    pub admitted_at: DateTime<Utc>,
    pub failure: FlowFailure,
    pub diagnosis: Diagnosis,
    pub suspend_count: u64,
    pub checkpoint_version: i64,
}

pub struct FlowHospital {
    config: HospitalConfig,
    records: DashMap<FlowId, Vec<MedicalRecord>>,
    observation: DashSet<FlowId>,
}

impl FlowHospital {
    pub fn new(config: HospitalConfig) -> Self {
        Self { config,
               records: DashMap::new(),
               observation: DashSet::new() }
    }

    pub fn config(&self) -> &HospitalConfig {
        &self.config
    }

    /// Registra el fallo y devuelve su disposición.
    pub fn admit(&self, report: &FailureReport) -> Diagnosis {
        let mut history = self.records.entry(report.flow_id).or_default();
        let diagnosis = match report.failure.kind {
            FailureKind::TransientInfrastructure => self.retry_or_observe(&history, report.suspend_count),
            FailureKind::SessionTimeout if self.config.retry_session_timeouts => {
                self.retry_or_observe(&history, report.suspend_count)
            }
            FailureKind::InternalLogicFault => Diagnosis::OvernightObservation,
            FailureKind::SessionTimeout | FailureKind::CounterpartyRejected | FailureKind::Cancelled => Diagnosis::Terminal,
        };
        match diagnosis {
            Diagnosis::Discharge { attempt, backoff } => {
                log::info!("hospital: flujo {} reintento {} en {:?} ({})",
                           report.flow_id,
                           attempt,
                           backoff,
                           report.failure)
            }
            Diagnosis::OvernightObservation => {
                log::warn!("hospital: flujo {} en observación ({})", report.flow_id, report.failure);
                self.observation.insert(report.flow_id);
            }
            Diagnosis::Terminal => log::warn!("hospital: flujo {} sin remedio ({})", report.flow_id, report.failure),
        }
        history.push(MedicalRecord { flow_id: report.flow_id,
                                     admitted_at: Utc::now(),
                                     failure: report.failure.clone(),
                                     diagnosis,
                                     suspend_count: report.suspend_count,
                                     checkpoint_version: report.checkpoint_version });
        diagnosis
    }

    // Los intentos se cuentan por paso (suspend_count) y se reinician tras
    // una observación, para que un reintento manual tenga cupo completo.
    fn retry_or_observe(&self, history: &[MedicalRecord], suspend_count: u64) -> Diagnosis {
        let attempts = history.iter()
                              .rev()
                              .take_while(|r| {
                                  r.suspend_count == suspend_count
                                  && r.diagnosis != Diagnosis::OvernightObservation
                              })
                              .filter(|r| matches!(r.diagnosis, Diagnosis::Discharge { .. }))
                              .count() as u32;
        if attempts < self.config.max_retries {
            let attempt = attempts + 1;
            Diagnosis::Discharge { attempt,
                                   backoff: self.backoff(attempt) }
        } else {
            Diagnosis::OvernightObservation
        }
    }

    /// Backoff exponencial `base * 2^(attempt-1)` acotado por `max_backoff`.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        self.config
            .base_backoff
            .saturating_mul(factor)
            .min(self.config.max_backoff)
    }

    pub fn medical_history(&self, flow_id: &FlowId) -> Vec<MedicalRecord> {
        self.records
            .get(flow_id)
            .map(|h| h.value().clone())
            .unwrap_or_default()
    }

    /// Flujos que esperan intervención del operador.
    pub fn patients(&self) -> Vec<FlowId> {
        let mut ids: Vec<FlowId> = self.observation.iter().map(|id| *id).collect();
        ids.sort();
        ids
    }

    pub fn is_under_observation(&self, flow_id: &FlowId) -> bool {
        self.observation.contains(flow_id)
    }

    /// Vuelve a poner en observación un flujo cuyo checkpoint ya está
    /// `Hospitalized`, por ejemplo al rehidratarlo tras un reinicio.
    pub fn observe(&self, flow_id: FlowId) {
        if self.observation.insert(flow_id) {
            log::info!("hospital: flujo {} sigue en observación", flow_id);
        }
    }

    /// El operador sacó el flujo de observación (reintento o fallo forzado).
    pub fn release(&self, flow_id: &FlowId) {
        self.observation.remove(flow_id);
    }

    /// Olvida todo lo relativo a un flujo purgado.
    pub fn forget(&self, flow_id: &FlowId) {
        self.observation.remove(flow_id);
        self.records.remove(flow_id);
    }
}

impl Default for FlowHospital {
    fn default() -> Self {
        Self::new(HospitalConfig::default())
    }
}
