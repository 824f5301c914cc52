//! Provisioning Parameters
//!
//! Storage class parameters arrive as a flat `key -> string` map. The
//! mapping between wire keys and [`StorageParameters`] fields is declared
//! once in [`FIELDS`]; parsing and rendering both walk that table.

use crate::error::{Error, Result};
use std::collections::BTreeMap;

// =============================================================================
// Field Table
// =============================================================================

/// Value kinds a parameter can carry on the wire
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldKind {
    Text,
    Bool,
    Int,
}

/// Typed parameter value
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FieldValue {
    Text(String),
    Bool(bool),
    Int(u32),
}

impl FieldValue {
    fn render(&self) -> String {
        match self {
            FieldValue::Text(value) => value.clone(),
            FieldValue::Bool(value) => value.to_string(),
            FieldValue::Int(value) => value.to_string(),
        }
    }
}

/// One row of the declarative wire mapping
pub struct ParamField {
    pub wire_key: &'static str,
    pub kind: FieldKind,
    /// Accepted values for text fields; empty accepts anything
    pub allowed: &'static [&'static str],
    pub get: fn(&StorageParameters) -> Option<FieldValue>,
    pub set: fn(&mut StorageParameters, FieldValue),
}

impl ParamField {
    fn parse(&self, raw: &str) -> Result<FieldValue> {
        let raw = raw.trim();
        let value = match self.kind {
            FieldKind::Text => {
                if !self.allowed.is_empty() && !self.allowed.contains(&raw) {
                    return Err(Error::invalid(format!(
                        "parameter {} must be one of {}, got {:?}",
                        self.wire_key,
                        self.allowed.join(", "),
                        raw
                    )));
                }
                FieldValue::Text(raw.to_string())
            }
            FieldKind::Bool => FieldValue::Bool(parse_bool(self.wire_key, raw)?),
            FieldKind::Int => FieldValue::Int(raw.parse().map_err(|_| {
                Error::invalid(format!(
                    "parameter {} must be a non-negative integer, got {:?}",
                    self.wire_key, raw
                ))
            })?),
        };

        Ok(value)
    }
}

fn parse_bool(key: &str, raw: &str) -> Result<bool> {
    match raw.to_lowercase().as_str() {
        "true" | "1" | "yes" => Ok(true),
        "false" | "0" | "no" | "" => Ok(false),
        _ => Err(Error::invalid(format!(
            "parameter {} must be a boolean, got {:?}",
            key, raw
        ))),
    }
}

fn text(value: &Option<String>) -> Option<FieldValue> {
    value.clone().map(FieldValue::Text)
}

fn int(value: Option<u32>) -> Option<FieldValue> {
    value.map(FieldValue::Int)
}

fn flag(value: bool) -> Option<FieldValue> {
    value.then_some(FieldValue::Bool(true))
}

fn into_text(value: FieldValue) -> Option<String> {
    match value {
        FieldValue::Text(value) if !value.is_empty() => Some(value),
        _ => None,
    }
}

fn into_int(value: FieldValue) -> Option<u32> {
    match value {
        FieldValue::Int(value) => Some(value),
        _ => None,
    }
}

fn into_bool(value: FieldValue) -> bool {
    matches!(value, FieldValue::Bool(true))
}

/// Wire mapping for [`StorageParameters`]
pub static FIELDS: &[ParamField] = &[
    ParamField {
        wire_key: "storage",
        kind: FieldKind::Text,
        allowed: &[],
        get: |p| (!p.storage.is_empty()).then(|| FieldValue::Text(p.storage.clone())),
        set: |p, v| p.storage = into_text(v).unwrap_or_default(),
    },
    ParamField {
        wire_key: "storageFormat",
        kind: FieldKind::Text,
        allowed: &["raw", "qcow2", "vmdk"],
        get: |p| text(&p.format),
        set: |p, v| p.format = into_text(v),
    },
    ParamField {
        wire_key: "cache",
        kind: FieldKind::Text,
        allowed: &["directsync", "none", "writethrough", "writeback", "unsafe"],
        get: |p| text(&p.cache),
        set: |p, v| p.cache = into_text(v),
    },
    ParamField {
        wire_key: "ssd",
        kind: FieldKind::Bool,
        allowed: &[],
        get: |p| flag(p.ssd),
        set: |p, v| p.ssd = into_bool(v),
    },
    ParamField {
        wire_key: "diskIOPS",
        kind: FieldKind::Int,
        allowed: &[],
        get: |p| int(p.disk_iops),
        set: |p, v| p.disk_iops = into_int(v),
    },
    ParamField {
        wire_key: "diskMBps",
        kind: FieldKind::Int,
        allowed: &[],
        get: |p| int(p.disk_mbps),
        set: |p, v| p.disk_mbps = into_int(v),
    },
    ParamField {
        wire_key: "blockSize",
        kind: FieldKind::Int,
        allowed: &[],
        get: |p| int(p.block_size),
        set: |p, v| p.block_size = into_int(v),
    },
    ParamField {
        wire_key: "inodeSize",
        kind: FieldKind::Int,
        allowed: &[],
        get: |p| int(p.inode_size),
        set: |p, v| p.inode_size = into_int(v),
    },
    ParamField {
        wire_key: "replicate",
        kind: FieldKind::Bool,
        allowed: &[],
        get: |p| flag(p.replicate),
        set: |p, v| p.replicate = into_bool(v),
    },
    ParamField {
        wire_key: "replicateSchedule",
        kind: FieldKind::Text,
        allowed: &[],
        get: |p| text(&p.replicate_schedule),
        set: |p, v| p.replicate_schedule = into_text(v),
    },
    ParamField {
        wire_key: "replicateZones",
        kind: FieldKind::Text,
        allowed: &[],
        get: |p| text(&p.replicate_zones),
        set: |p, v| p.replicate_zones = into_text(v),
    },
    ParamField {
        wire_key: "backup",
        kind: FieldKind::Bool,
        allowed: &[],
        get: |p| flag(p.backup),
        set: |p, v| p.backup = into_bool(v),
    },
];

// =============================================================================
// Storage Parameters
// =============================================================================

/// Request-time provisioning parameters.
///
/// Only `storage`, `format`, `ssd`, `block_size` and `inode_size` change
/// what the driver does. The disk tuning fields (`cache`, `disk_iops`,
/// `disk_mbps`, `backup`) and the `replicate*` fields are validated and
/// carried in the volume context for whatever attaches the disk to a VM;
/// the driver never applies them itself.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StorageParameters {
    /// Storage pool id on the hypervisor
    pub storage: String,
    /// On-disk format (`raw`, `qcow2`, `vmdk`)
    pub format: Option<String>,
    /// Disk cache mode; context only
    pub cache: Option<String>,
    /// Disk is backed by SSD; implies discard
    pub ssd: bool,
    /// Per-disk IOPS cap; context only
    pub disk_iops: Option<u32>,
    /// Per-disk throughput cap in MB/s; context only
    pub disk_mbps: Option<u32>,
    /// Filesystem block size
    pub block_size: Option<u32>,
    /// Filesystem inode size
    pub inode_size: Option<u32>,
    /// Enable storage replication; context only
    pub replicate: bool,
    /// Replication schedule
    pub replicate_schedule: Option<String>,
    /// Comma-separated replication target zones
    pub replicate_zones: Option<String>,
    /// Include the disk in hypervisor backups; context only
    pub backup: bool,
}

impl StorageParameters {
    /// Parse a wire map; unknown keys are ignored
    pub fn from_map(map: &BTreeMap<String, String>) -> Result<Self> {
        let mut params = Self::default();

        for field in FIELDS {
            if let Some(raw) = map.get(field.wire_key) {
                let value = field.parse(raw)?;
                (field.set)(&mut params, value);
            }
        }

        Ok(params)
    }

    /// Render the set fields back to a wire map
    pub fn to_map(&self) -> BTreeMap<String, String> {
        FIELDS
            .iter()
            .filter_map(|field| {
                (field.get)(self).map(|value| (field.wire_key.to_string(), value.render()))
            })
            .collect()
    }

    pub fn format(&self) -> &str {
        self.format.as_deref().unwrap_or("")
    }

    /// Extra mount options implied by the parameters
    pub fn mount_options(&self) -> Vec<String> {
        if self.ssd {
            vec!["discard".to_string()]
        } else {
            Vec::new()
        }
    }

    /// Extra `mkfs` arguments for the given filesystem
    pub fn mkfs_args(&self, fs_type: &str) -> Vec<String> {
        let mut args = Vec::new();

        match fs_type {
            "ext2" | "ext3" | "ext4" => {
                if let Some(size) = self.block_size {
                    args.extend(["-b".to_string(), size.to_string()]);
                }
                if let Some(size) = self.inode_size {
                    args.extend(["-I".to_string(), size.to_string()]);
                }
            }
            "xfs" => {
                if let Some(size) = self.block_size {
                    args.extend(["-b".to_string(), format!("size={}", size)]);
                }
                if let Some(size) = self.inode_size {
                    args.extend(["-i".to_string(), format!("size={}", size)]);
                }
            }
            _ => {}
        }

        args
    }
}
