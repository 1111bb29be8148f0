//! Paquetes que deben estar subidos antes de poder crear el job.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use blake3::Hasher;
use common::Step;
use tracing::{debug, info};

use crate::config::UploadPreparerConfig;
use crate::error::PrepareError;
use crate::remote::JobService;

/// Paquete local que hay que dejar disponible en el entorno remoto.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PackageSpec {
    pub name: String,
    pub version: String,
    /// Artefacto local ya empaquetado (ej: un .tgz)
    pub path: PathBuf,
}

impl PackageSpec {
    pub fn key(&self) -> PackageKey {
        PackageKey {
            name: self.name.clone(),
            path: self.path.clone(),
            version: self.version.clone(),
        }
    }
}

/// Identidad canónica de un paquete: (nombre, ruta, versión).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PackageKey {
    pub name: String,
    pub path: PathBuf,
    pub version: String,
}

/// Dónde queda el paquete en el entorno remoto y cómo inicializarlo.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PreparedAsset {
    pub remote_path: String,
    pub init: String,
}

#[async_trait]
pub trait PackagePreparer: Send + Sync {
    /// Ruta remota y comando de init del paquete; determinista y sin I/O.
    fn target(&self, package: &PackageSpec) -> PreparedAsset;

    /// Deja el paquete en `target.remote_path`. Puede tardar lo que sea.
    async fn prepare(
        &self,
        package: &PackageSpec,
        target: &PreparedAsset,
    ) -> Result<(), PrepareError>;
}

/// Fábrica de pasos atada a un paquete preparado: cada paso ejecuta la
/// herramienta del paquete y arrastra su asset e init.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PackageStep {
    tool: String,
    asset: PreparedAsset,
}

impl PackageStep {
    pub fn asset(&self) -> &PreparedAsset {
        &self.asset
    }

    pub fn step<I, S>(&self, args: I) -> Step
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut parts = vec![self.tool.clone()];
        parts.extend(args.into_iter().map(|a| a.as_ref().to_string()));
        Step::builder()
            .command(parts.join(" "))
            .asset(self.asset.remote_path.clone())
            .init(self.asset.init.clone())
            .build()
    }
}

/// Resultado de pedir un paquete al gate.
#[derive(Debug)]
pub struct PackageRequest {
    pub step: PackageStep,
    /// Some si hay que lanzar la preparación (primera vez que se pide)
    pub start: Option<(PackageSpec, PreparedAsset)>,
}

/// Contabilidad de preparaciones pendientes.
///
/// No lanza tareas: el dueño (el sink) arranca `prepare` cuando `request`
/// devuelve `start`, y avisa con `complete` al terminar.
pub struct PackageGate {
    preparer: Arc<dyn PackagePreparer>,
    requested: HashMap<PackageKey, PackageStep>,
    outstanding: usize,
    failure: Option<String>,
}

impl PackageGate {
    pub fn new(preparer: Arc<dyn PackagePreparer>) -> Self {
        Self {
            preparer,
            requested: HashMap::new(),
            outstanding: 0,
            failure: None,
        }
    }

    pub fn preparer(&self) -> Arc<dyn PackagePreparer> {
        Arc::clone(&self.preparer)
    }

    pub fn request(&mut self, package: PackageSpec) -> PackageRequest {
        let key = package.key();
        if let Some(step) = self.requested.get(&key) {
            debug!("paquete {}@{} ya pedido, reutilizando", key.name, key.version);
            return PackageRequest {
                step: step.clone(),
                start: None,
            };
        }

        let target = self.preparer.target(&package);
        let step = PackageStep {
            tool: package.name.clone(),
            asset: target.clone(),
        };
        self.requested.insert(key, step.clone());
        self.outstanding += 1;

        info!(
            "preparando paquete {}@{} -> {} ({} pendientes)",
            package.name, package.version, target.remote_path, self.outstanding
        );

        PackageRequest {
            step,
            start: Some((package, target)),
        }
    }

    /// Registra el fin de una preparación. Devuelve true si el gate quedó abierto.
    pub fn complete(&mut self, key: &PackageKey, result: Result<(), String>) -> bool {
        self.outstanding = self.outstanding.saturating_sub(1);
        if let Err(reason) = result {
            self.failure
                .get_or_insert_with(|| format!("{}@{}: {}", key.name, key.version, reason));
        }
        self.is_open()
    }

    pub fn outstanding(&self) -> usize {
        self.outstanding
    }

    pub fn failure(&self) -> Option<&str> {
        self.failure.as_deref()
    }

    pub fn is_open(&self) -> bool {
        self.outstanding == 0 && self.failure.is_none()
    }
}

/// Primeros 8 hex del blake3 de la ruta local: dos artefactos con igual
/// nombre y versión no se pisan en el store.
fn path_digest(package: &PackageSpec) -> String {
    let mut h = Hasher::new();
    h.update(package.path.to_string_lossy().as_bytes());
    let mut hex = h.finalize().to_hex().to_string();
    hex.truncate(8);
    hex
}

/// Sube el artefacto local al object store del servicio remoto.
pub struct UploadPreparer {
    service: Arc<dyn JobService>,
    config: UploadPreparerConfig,
}

impl UploadPreparer {
    pub fn new(service: Arc<dyn JobService>, config: UploadPreparerConfig) -> Self {
        Self { service, config }
    }
}

#[async_trait]
impl PackagePreparer for UploadPreparer {
    fn target(&self, package: &PackageSpec) -> PreparedAsset {
        let remote_path = format!(
            "{}/{}-{}-{}.tgz",
            self.config.remote_root.trim_end_matches('/'),
            package.name,
            package.version,
            path_digest(package)
        );
        let init = self.config.init_template.replace("{asset}", &remote_path);
        PreparedAsset { remote_path, init }
    }

    async fn prepare(
        &self,
        package: &PackageSpec,
        target: &PreparedAsset,
    ) -> Result<(), PrepareError> {
        let body = tokio::fs::read(&package.path)
            .await
            .map_err(|source| PrepareError::Io {
                path: package.path.display().to_string(),
                source,
            })?;
        let size = body.len();
        self.service.put_object(&target.remote_path, body).await?;
        debug!("subido {} ({} bytes)", target.remote_path, size);
        Ok(())
    }
}
