// Archivo: config.rs
// Propósito: configuración del motor de flujos. Valores por defecto
// razonables y lectura desde variables de entorno (con `.env` vía dotenvy).
use crate::errors::{FlowError, Result};
use crate::hospital::HospitalConfig;
use crate::router::RouterConfig;
use std::str::FromStr;
use std::time::Duration;

/// Parámetros del scheduler, del hospital, del router y de la retención.
#[derive(Debug, Clone)]
pub struct FlowEngineConfig {
    /// Workers que ejecutan pasos en paralelo (permisos del semáforo).
    pub workers: usize,
    /// Iteraciones máximas de un flujo dentro de un mismo avance; superarlas
    /// se trata como fallo interno (livelock).
    pub max_steps_per_advance: u32,
    pub max_retries: u32,
    pub base_backoff: Duration,
    pub max_backoff: Duration,
    /// Si es `true`, el hospital reintenta los `session-timeout`.
    pub retry_session_timeouts: bool,
    pub pending_max_messages: usize,
    pub pending_timeout: Duration,
    /// Periodo del barrido de mensajes pendientes caducados.
    pub sweep_interval: Duration,
    pub completed_retention: Duration,
    pub failed_retention: Duration,
    /// Plazo máximo de espera de un mensaje en `receive`; vencido, el flujo
    /// falla con `session-timeout`. `None` desactiva el plazo.
    pub receive_timeout: Option<Duration>,
}

impl Default for FlowEngineConfig {
    fn default() -> Self {
        Self { workers: 4,
               max_steps_per_advance: 64,
               max_retries: 3,
               base_backoff: Duration::from_millis(100),
               max_backoff: Duration::from_millis(10_000),
               retry_session_timeouts: false,
               pending_max_messages: 1024,
               pending_timeout: Duration::from_millis(30_000),
               sweep_interval: Duration::from_millis(250),
               completed_retention: Duration::from_secs(3600),
               failed_retention: Duration::from_secs(7 * 24 * 3600),
               receive_timeout: Some(Duration::from_secs(300)) }
    }
}

fn env_or<T: FromStr>(key: &str, default: T) -> Result<T> {
    match std::env::var(key) {
        Ok(raw) => raw.trim()
                      .parse::<T>()
                      .map_err(|_| FlowError::Other(format!("valor inválido para {}: {}", key, raw))),
        Err(_) => Ok(default),
    }
}

fn env_millis(key: &str, default: Duration) -> Result<Duration> {
    Ok(Duration::from_millis(env_or(key, default.as_millis() as u64)?))
}

fn env_secs(key: &str, default: Duration) -> Result<Duration> {
    Ok(Duration::from_secs(env_or(key, default.as_secs())?))
}

impl FlowEngineConfig {
    /// Lee la configuración desde el entorno. Las variables ausentes toman
    /// el valor por defecto; las presentes pero inválidas son error.
    ///
    /// Variables: `FLOW_WORKERS`, `FLOW_MAX_STEPS_PER_ADVANCE`,
    /// `FLOW_MAX_RETRIES`, `FLOW_BASE_BACKOFF_MS`, `FLOW_MAX_BACKOFF_MS`,
    /// `FLOW_RETRY_SESSION_TIMEOUTS`, `FLOW_PENDING_MAX_MESSAGES`,
    /// `FLOW_PENDING_TIMEOUT_MS`, `FLOW_SWEEP_INTERVAL_MS`,
    /// `FLOW_COMPLETED_RETENTION_SECS`, `FLOW_FAILED_RETENTION_SECS`,
    /// `FLOW_RECEIVE_TIMEOUT_MS` (0 desactiva el plazo).
    pub fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok();
        let d = Self::default();
        let receive_timeout_ms = env_or("FLOW_RECEIVE_TIMEOUT_MS",
                                        d.receive_timeout.map(|t| t.as_millis() as u64).unwrap_or(0))?;
        let cfg = Self { workers: env_or("FLOW_WORKERS", d.workers)?,
                         max_steps_per_advance: env_or("FLOW_MAX_STEPS_PER_ADVANCE", d.max_steps_per_advance)?,
                         max_retries: env_or("FLOW_MAX_RETRIES", d.max_retries)?,
                         base_backoff: env_millis("FLOW_BASE_BACKOFF_MS", d.base_backoff)?,
                         max_backoff: env_millis("FLOW_MAX_BACKOFF_MS", d.max_backoff)?,
                         retry_session_timeouts: env_or("FLOW_RETRY_SESSION_TIMEOUTS", d.retry_session_timeouts)?,
                         pending_max_messages: env_or("FLOW_PENDING_MAX_MESSAGES", d.pending_max_messages)?,
                         pending_timeout: env_millis("FLOW_PENDING_TIMEOUT_MS", d.pending_timeout)?,
                         sweep_interval: env_millis("FLOW_SWEEP_INTERVAL_MS", d.sweep_interval)?,
                         completed_retention: env_secs("FLOW_COMPLETED_RETENTION_SECS", d.completed_retention)?,
                         failed_retention: env_secs("FLOW_FAILED_RETENTION_SECS", d.failed_retention)?,
                         receive_timeout: (receive_timeout_ms > 0).then(|| Duration::from_millis(receive_timeout_ms)) };
        if cfg.workers == 0 {
            return Err(FlowError::Other("FLOW_WORKERS debe ser mayor que 0".into()));
        }
        log::debug!("configuración del motor: {:?}", cfg);
        Ok(cfg)
    }

    pub fn hospital(&self) -> HospitalConfig {
        HospitalConfig { max_retries: self.max_retries,
                         base_backoff: self.base_backoff,
                         max_backoff: self.max_backoff,
                         retry_session_timeouts: self.retry_session_timeouts }
    }

    pub fn router(&self) -> RouterConfig {
        RouterConfig { max_pending: self.pending_max_messages,
                       pending_timeout: self.pending_timeout }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_env_defaults_and_overrides() {
        let d = FlowEngineConfig::default();
        let cfg = FlowEngineConfig::from_env().expect("config");
        assert_eq!(cfg.base_backoff, d.base_backoff);
        assert_eq!(cfg.max_backoff, d.max_backoff);
        assert_eq!(cfg.pending_timeout, d.pending_timeout);
        assert_eq!(cfg.sweep_interval, d.sweep_interval);
        assert_eq!(cfg.completed_retention, d.completed_retention);
        assert_eq!(cfg.failed_retention, d.failed_retention);
        assert_eq!(cfg.receive_timeout, d.receive_timeout);

        std::env::set_var("FLOW_BASE_BACKOFF_MS", "250");
        std::env::set_var("FLOW_RECEIVE_TIMEOUT_MS", "0");
        let cfg = FlowEngineConfig::from_env();
        std::env::remove_var("FLOW_BASE_BACKOFF_MS");
        std::env::remove_var("FLOW_RECEIVE_TIMEOUT_MS");
        let cfg = cfg.expect("config");
        assert_eq!(cfg.base_backoff, Duration::from_millis(250));
        assert_eq!(cfg.receive_timeout, None);

        std::env::set_var("FLOW_WORKERS", "muchos");
        let invalid = FlowEngineConfig::from_env();
        std::env::remove_var("FLOW_WORKERS");
        assert!(invalid.is_err());
    }
}
