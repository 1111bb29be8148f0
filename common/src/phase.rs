use serde::{Deserialize, Serialize};
use std::{fmt, str::FromStr};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PhaseKind {
    Map,
    Reduce,
}

impl fmt::Display for PhaseKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PhaseKind::Map => f.write_str("map"),
            PhaseKind::Reduce => f.write_str("reduce"),
        }
    }
}

impl FromStr for PhaseKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "map" => Ok(PhaseKind::Map),
            "reduce" => Ok(PhaseKind::Reduce),
            other => Err(format!("tipo de fase desconocido: {other}")),
        }
    }
}

/// Fase tal como la consume la API de jobs remota.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PhaseDescriptor {
    /// Se serializa como "type" en el JSON.
    #[serde(rename = "type")]
    pub kind: PhaseKind,

    /// Pipeline de shell, ej: "grep -i error | wc -l"
    pub exec: String,

    /// Artefactos que el entorno remoto debe tener disponibles
    pub assets: Vec<String>,

    /// Comandos de inicialización unidos con " && "
    pub init: String,

    /// Tag de la imagen de ejecución
    pub image: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn phase_kind_parses_case_insensitively() {
        assert_eq!("MAP".parse::<PhaseKind>().unwrap(), PhaseKind::Map);
        assert_eq!(" reduce".parse::<PhaseKind>().unwrap(), PhaseKind::Reduce);
        assert!("shuffle".parse::<PhaseKind>().is_err());
    }

    #[test]
    fn phase_descriptor_uses_type_field() {
        let phase = PhaseDescriptor {
            kind: PhaseKind::Map,
            exec: "cat".to_string(),
            assets: vec!["/a/b.tgz".to_string()],
            init: "true".to_string(),
            image: "13.3".to_string(),
        };

        let v = serde_json::to_value(&phase).unwrap();
        assert_eq!(v["type"], "map");
        assert_eq!(v["exec"], "cat");
        assert_eq!(v["assets"][0], "/a/b.tgz");
        assert!(v.get("kind").is_none());
    }
}
