use serde::{Deserialize, Serialize};

use crate::job::JobKey;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AddKeyRequest {
    pub key: JobKey,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Ack {
    pub ok: bool,
}

/// Entrada del listado del object store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectEntry {
    pub parent: String,
    pub name: String,
    pub size: u64,
}

impl ObjectEntry {
    /// Ruta completa del objeto: `parent/name` (o solo `parent` si no hay nombre).
    pub fn path(&self) -> String {
        if self.name.is_empty() {
            self.parent.clone()
        } else {
            format!("{}/{}", self.parent, self.name)
        }
    }
}

impl From<&ObjectEntry> for JobKey {
    fn from(entry: &ObjectEntry) -> Self {
        JobKey::new(entry.path())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn object_entry_path_joins_parent_and_name() {
        let entry = ObjectEntry {
            parent: "/acme/stor/logs".to_string(),
            name: "a.log".to_string(),
            size: 3,
        };
        assert_eq!(entry.path(), "/acme/stor/logs/a.log");
        assert_eq!(JobKey::from(&entry).as_str(), "/acme/stor/logs/a.log");
    }

    #[test]
    fn object_entry_without_name_is_its_parent() {
        let entry = ObjectEntry {
            parent: "/acme/stor/single".to_string(),
            name: String::new(),
            size: 0,
        };
        assert_eq!(entry.path(), "/acme/stor/single");
    }
}
