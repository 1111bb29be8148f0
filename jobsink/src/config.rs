use std::time::Duration;

use common::DEFAULT_IMAGE;

/// Qué hacer cuando falla el envío de una clave individual.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum KeyFailurePolicy {
    /// Solo falla el `write` de esa clave; el job sigue.
    #[default]
    Continue,
    /// La primera clave fallida deja el sink en estado terminal.
    Abort,
}

#[derive(Debug, Clone)]
pub struct SinkConfig {
    /// Nombre del job en el servicio remoto
    pub name: String,
    /// Tag de la imagen de ejecución de cada fase
    pub image: String,
    /// Cada cuánto se consulta el estado del job una vez cerrada la entrada
    pub poll_interval: Duration,
    pub key_failure_policy: KeyFailurePolicy,
    /// Herramienta que vuelca la salida del job en un destino final
    pub pipe_tool: String,
}

impl SinkConfig {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }
}

impl Default for SinkConfig {
    fn default() -> Self {
        Self {
            name: "job".to_string(),
            image: DEFAULT_IMAGE.to_string(),
            poll_interval: Duration::from_secs(1),
            key_failure_policy: KeyFailurePolicy::Continue,
            pipe_tool: "mpipe".to_string(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct HttpServiceConfig {
    /// ej: http://localhost:8080
    pub base_url: String,
    pub timeout: Duration,
}

impl Default for HttpServiceConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:8080".to_string(),
            timeout: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Clone)]
pub struct UploadPreparerConfig {
    /// Directorio remoto donde se suben los paquetes
    pub remote_root: String,
    /// Comando de init; `{asset}` se reemplaza por la ruta remota
    pub init_template: String,
}

impl Default for UploadPreparerConfig {
    fn default() -> Self {
        Self {
            remote_root: "/packages".to_string(),
            init_template: "cd /var/tmp && tar xzf {asset}".to_string(),
        }
    }
}
