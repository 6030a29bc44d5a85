//! Storage record model and wire mapping
//!
//! A `StorageRecord` is the typed, validated view of one registry document.
//! The kind-specific fields live on the `StorageKind` variants, so a record
//! that exists at all carries exactly the fields its kind allows. The
//! permissive wire form is `RegistryDoc`; converting it into a record is
//! where structural validation happens, and a document missing its `kind`
//! or `deleted` marker is corrupt — never "absent".

use kvgrid_common::{Error, Result};
use kvgrid_store::Doc;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Kind discriminators as stored in registry documents
pub const KIND_ACCOUNT: &str = "ACCOUNT";
pub const KIND_VM: &str = "VM";
pub const KIND_TEMP: &str = "TEMP";

/// What a storage belongs to, with the fields valid for that kind
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum StorageKind {
    /// Account-owned named storage
    Account {
        owner: String,
        description: Option<String>,
    },
    /// Storage bound to one virtual machine
    Vm { vm_id: String },
    /// Anonymous storage that expires after its TTL
    Temp { ttl_ms: i64, expires_at_ms: i64 },
}

impl StorageKind {
    /// Wire discriminator for this kind
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Account { .. } => KIND_ACCOUNT,
            Self::Vm { .. } => KIND_VM,
            Self::Temp { .. } => KIND_TEMP,
        }
    }
}

/// One storage namespace registered in the control plane
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StorageRecord {
    /// Store-assigned identifier
    pub id: String,
    /// Kind and its kind-specific fields
    pub kind: StorageKind,
    /// Display name (account storages; optional elsewhere)
    pub name: Option<String>,
    /// Whether per-key history is recorded for this storage
    pub history_enabled: bool,
    /// Soft-delete marker; purge jobs remove the document later
    pub deleted: bool,
    /// Last mutation time, drives the incremental invalidation scans
    pub last_updated_ms: i64,
}

impl StorageRecord {
    /// Decode and validate a stored document
    pub fn from_store_doc(doc: Doc) -> Result<Self> {
        let wire: RegistryDoc = serde_json::from_value(doc.source)
            .map_err(|e| Error::serialization(format!("registry doc {}: {e}", doc.id)))?;
        wire.into_record(doc.id)
    }

    /// Wire form of this record
    #[must_use]
    pub fn to_doc(&self) -> RegistryDoc {
        let mut doc = RegistryDoc {
            kind: Some(self.kind.as_str().to_string()),
            name: self.name.clone(),
            history_enabled: Some(self.history_enabled),
            deleted: Some(self.deleted),
            last_updated: Some(self.last_updated_ms),
            ..RegistryDoc::default()
        };
        match &self.kind {
            StorageKind::Account { owner, description } => {
                doc.account = Some(owner.clone());
                doc.description = description.clone();
            }
            StorageKind::Vm { vm_id } => doc.vm = Some(vm_id.clone()),
            StorageKind::Temp { ttl_ms, expires_at_ms } => {
                doc.ttl = Some(*ttl_ms);
                doc.expires_at = Some(*expires_at_ms);
            }
        }
        doc
    }

    /// Wire form as a JSON value, ready for the store
    pub fn to_value(&self) -> Result<Value> {
        serde_json::to_value(self.to_doc()).map_err(|e| Error::serialization(e.to_string()))
    }
}

/// Raw registry document as stored
///
/// Every field is optional here; [`RegistryDoc::into_record`] decides what
/// absence means for each of them.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct RegistryDoc {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub account: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub vm: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub history_enabled: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ttl: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub deleted: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_updated: Option<i64>,
}

impl RegistryDoc {
    /// Validate into a typed record
    ///
    /// `kind` and `deleted` are load-bearing: without them the document
    /// cannot be interpreted safely, so their absence is a data-integrity
    /// failure, as is a kind missing its required fields.
    pub fn into_record(self, id: String) -> Result<StorageRecord> {
        let corrupt = |field: &'static str| Error::CorruptRecord { id: id.clone(), field };

        let kind = match self.kind.as_deref() {
            Some(KIND_ACCOUNT) => StorageKind::Account {
                owner: self.account.ok_or_else(|| corrupt("account"))?,
                description: self.description,
            },
            Some(KIND_VM) => StorageKind::Vm {
                vm_id: self.vm.ok_or_else(|| corrupt("vm"))?,
            },
            Some(KIND_TEMP) => StorageKind::Temp {
                ttl_ms: self.ttl.ok_or_else(|| corrupt("ttl"))?,
                expires_at_ms: self.expires_at.ok_or_else(|| corrupt("expires_at"))?,
            },
            _ => return Err(corrupt("kind")),
        };
        let deleted = self.deleted.ok_or_else(|| corrupt("deleted"))?;

        Ok(StorageRecord {
            id,
            kind,
            name: self.name,
            history_enabled: self.history_enabled.unwrap_or(false),
            deleted,
            last_updated_ms: self.last_updated.unwrap_or(0),
        })
    }
}

/// One per-key history entry, as written by the value backend
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryEntry {
    /// Key the operation touched
    pub key: String,
    /// Value after the operation, empty for deletes
    #[serde(default)]
    pub value: String,
    /// Operation name (set, delete, clear)
    #[serde(default)]
    pub operation: String,
    /// When the operation happened
    #[serde(rename = "timestamp", default)]
    pub timestamp_ms: i64,
}

impl HistoryEntry {
    /// Decode one history document
    pub fn from_store_doc(doc: &Doc) -> Result<Self> {
        serde_json::from_value(doc.source.clone())
            .map_err(|e| Error::serialization(format!("history doc {}: {e}", doc.id)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn temp_doc() -> Value {
        json!({
            "kind": "TEMP",
            "ttl": 60_000,
            "expires_at": 1_000_000,
            "history_enabled": false,
            "deleted": false,
            "last_updated": 500,
        })
    }

    #[test]
    fn test_temp_roundtrip() {
        let record = StorageRecord::from_store_doc(Doc {
            id: "s-1".to_string(),
            source: temp_doc(),
        })
        .unwrap();
        assert_eq!(record.kind, StorageKind::Temp { ttl_ms: 60_000, expires_at_ms: 1_000_000 });
        assert!(!record.deleted);

        let back = record.to_value().unwrap();
        let again = StorageRecord::from_store_doc(Doc {
            id: "s-1".to_string(),
            source: back,
        })
        .unwrap();
        assert_eq!(again, record);
    }

    #[test]
    fn test_account_fields_live_on_their_variant() {
        let record = StorageRecord {
            id: "s-2".to_string(),
            kind: StorageKind::Account {
                owner: "acct-1".to_string(),
                description: Some("docs".to_string()),
            },
            name: Some("primary".to_string()),
            history_enabled: true,
            deleted: false,
            last_updated_ms: 1,
        };
        let value = record.to_value().unwrap();
        assert_eq!(value["kind"], json!("ACCOUNT"));
        assert_eq!(value["account"], json!("acct-1"));
        assert!(value.get("ttl").is_none());
        assert!(value.get("vm").is_none());
    }

    #[test]
    fn test_missing_kind_is_corrupt() {
        let mut source = temp_doc();
        source.as_object_mut().unwrap().remove("kind");
        let err = StorageRecord::from_store_doc(Doc { id: "s-3".to_string(), source })
            .unwrap_err();
        assert!(matches!(err, Error::CorruptRecord { field: "kind", .. }));
    }

    #[test]
    fn test_missing_deleted_is_corrupt() {
        let mut source = temp_doc();
        source.as_object_mut().unwrap().remove("deleted");
        let err = StorageRecord::from_store_doc(Doc { id: "s-4".to_string(), source })
            .unwrap_err();
        assert!(matches!(err, Error::CorruptRecord { field: "deleted", .. }));
    }

    #[test]
    fn test_kind_specific_field_required() {
        let source = json!({ "kind": "VM", "deleted": false });
        let err = StorageRecord::from_store_doc(Doc { id: "s-5".to_string(), source })
            .unwrap_err();
        assert!(matches!(err, Error::CorruptRecord { field: "vm", .. }));
    }

    #[test]
    fn test_unknown_kind_is_corrupt() {
        let source = json!({ "kind": "GLOBAL", "deleted": false });
        let err = StorageRecord::from_store_doc(Doc { id: "s-6".to_string(), source })
            .unwrap_err();
        assert!(matches!(err, Error::CorruptRecord { field: "kind", .. }));
    }

    #[test]
    fn test_history_entry_tolerates_missing_optionals() {
        let doc = Doc {
            id: "h-1".to_string(),
            source: json!({ "key": "color" }),
        };
        let entry = HistoryEntry::from_store_doc(&doc).unwrap();
        assert_eq!(entry.key, "color");
        assert_eq!(entry.value, "");
        assert_eq!(entry.timestamp_ms, 0);
    }
}
