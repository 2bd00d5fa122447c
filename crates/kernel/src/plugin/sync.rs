//! Registry synchronization planning.
//!
//! Compares a fresh discovery against the persisted registry and produces a
//! [`SyncPlan`]. The plan is pure data; a [`PluginRegistry`] applies it in
//! one transaction.
//!
//! [`PluginRegistry`]: super::registry::PluginRegistry

use std::collections::BTreeMap;

use serde::Serialize;

use super::discovery::DiscoveryCatalog;
use super::error::PluginError;
use super::registry::PluginRecord;

/// Registry metadata taken from a descriptor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PluginMetadata {
    pub name: String,
    pub version: String,
    pub description: String,
    pub schema_name: String,
}

/// Metadata overwrite for an existing record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MetadataUpdate {
    pub metadata: PluginMetadata,
    /// Names of the fields that differ from the stored record.
    pub changed: Vec<&'static str>,
}

/// Changes needed to bring the registry in line with disk.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SyncPlan {
    /// Plugins on disk with no record. Inserted disabled.
    pub inserts: Vec<PluginMetadata>,
    /// Records whose metadata drifted from the descriptor.
    pub updates: Vec<MetadataUpdate>,
    /// Records with no plugin on disk. Reported, never removed.
    pub stale: Vec<String>,
}

impl SyncPlan {
    /// Whether applying the plan would change anything.
    pub fn is_empty(&self) -> bool {
        self.inserts.is_empty() && self.updates.is_empty()
    }

    /// Names of the records the plan writes, sorted.
    pub fn changed_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .inserts
            .iter()
            .map(|m| m.name.clone())
            .chain(self.updates.iter().map(|u| u.metadata.name.clone()))
            .collect();
        names.sort();
        names
    }
}

/// Outcome of a registry synchronization.
#[derive(Debug, Clone, Default, Serialize)]
pub struct SyncReport {
    /// Records inserted or updated.
    pub changed: u64,
    pub inserted: Vec<String>,
    pub updated: Vec<String>,
    pub stale: Vec<String>,
}

/// Build the plan that reconciles `records` with `discovered`.
///
/// The `enabled` flag never appears in the plan, so it is preserved for
/// every existing record.
pub fn plan_sync(
    discovered: &DiscoveryCatalog,
    records: &[PluginRecord],
) -> Result<SyncPlan, PluginError> {
    let stored: BTreeMap<&str, &PluginRecord> =
        records.iter().map(|r| (r.name.as_str(), r)).collect();

    let mut plan = SyncPlan::default();
    // schema name -> owning plugin, as the registry will look after the sync
    let mut schemas: BTreeMap<&str, &str> = BTreeMap::new();

    for (key, plugin) in discovered {
        let d = &plugin.descriptor;
        if key != &d.name {
            return Err(PluginError::NameMismatch {
                key: key.clone(),
                declared: d.name.clone(),
            });
        }
        claim_schema(&mut schemas, &d.schema_name, &d.name)?;

        let metadata = PluginMetadata {
            name: d.name.clone(),
            version: d.version.clone(),
            description: d.description.clone(),
            schema_name: d.schema_name.clone(),
        };

        match stored.get(d.name.as_str()) {
            None => plan.inserts.push(metadata),
            Some(record) => {
                let mut changed = Vec::new();
                if record.version != metadata.version {
                    changed.push("version");
                }
                if record.description != metadata.description {
                    changed.push("description");
                }
                if record.schema_name != metadata.schema_name {
                    changed.push("schema_name");
                }
                if !changed.is_empty() {
                    plan.updates.push(MetadataUpdate { metadata, changed });
                }
            }
        }
    }

    for record in records {
        if !discovered.contains_key(&record.name) {
            claim_schema(&mut schemas, &record.schema_name, &record.name)?;
            plan.stale.push(record.name.clone());
        }
    }
    plan.stale.sort();

    Ok(plan)
}

fn claim_schema<'a>(
    schemas: &mut BTreeMap<&'a str, &'a str>,
    schema: &'a str,
    plugin: &'a str,
) -> Result<(), PluginError> {
    match schemas.insert(schema, plugin) {
        Some(owner) if owner != plugin => Err(PluginError::SchemaNameConflict {
            schema: schema.to_string(),
            first: owner.to_string(),
            second: plugin.to_string(),
        }),
        _ => Ok(()),
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use std::path::PathBuf;

    use uuid::Uuid;

    use super::*;
    use crate::plugin::descriptor::PluginDescriptor;
    use crate::plugin::discovery::DiscoveredPlugin;

    fn discovered(entries: &[(&str, &str, &str)]) -> DiscoveryCatalog {
        entries
            .iter()
            .map(|(name, version, schema)| {
                (
                    name.to_string(),
                    DiscoveredPlugin {
                        descriptor: PluginDescriptor {
                            name: name.to_string(),
                            version: version.to_string(),
                            description: String::new(),
                            schema_name: schema.to_string(),
                            entry_point: PathBuf::from(format!("{name}.wasm")),
                        },
                        path: PathBuf::from(format!("/plugins/{name}")),
                    },
                )
            })
            .collect()
    }

    fn record(name: &str, version: &str, schema: &str, enabled: bool) -> PluginRecord {
        PluginRecord {
            id: Uuid::now_v7(),
            name: name.to_string(),
            description: String::new(),
            version: version.to_string(),
            schema_name: schema.to_string(),
            enabled,
            created_at: 0,
            updated_at: 0,
        }
    }

    #[test]
    fn new_plugins_are_inserted() {
        let plan = plan_sync(&discovered(&[("vsphere", "1.0.0", "vsphere")]), &[]).unwrap();
        assert_eq!(plan.inserts.len(), 1);
        assert_eq!(plan.inserts[0].name, "vsphere");
        assert!(plan.updates.is_empty());
    }

    #[test]
    fn unchanged_registry_yields_empty_plan() {
        let plan = plan_sync(
            &discovered(&[("vsphere", "1.0.0", "vsphere")]),
            &[record("vsphere", "1.0.0", "vsphere", true)],
        )
        .unwrap();
        assert!(plan.is_empty());
    }

    #[test]
    fn drifted_fields_are_listed() {
        let plan = plan_sync(
            &discovered(&[("vsphere", "1.1.0", "vsphere")]),
            &[record("vsphere", "1.0.0", "vsphere", true)],
        )
        .unwrap();
        assert_eq!(plan.updates.len(), 1);
        assert_eq!(plan.updates[0].changed, vec!["version"]);
        assert_eq!(plan.changed_names(), vec!["vsphere".to_string()]);
    }

    #[test]
    fn stale_records_are_reported() {
        let plan = plan_sync(
            &discovered(&[("vsphere", "1.0.0", "vsphere")]),
            &[
                record("vsphere", "1.0.0", "vsphere", false),
                record("ghost", "0.1.0", "ghost", true),
            ],
        )
        .unwrap();
        assert!(plan.is_empty());
        assert_eq!(plan.stale, vec!["ghost".to_string()]);
    }

    #[test]
    fn key_must_match_declared_name() {
        let mut catalog = discovered(&[("vsphere", "1.0.0", "vsphere")]);
        let plugin = catalog.remove("vsphere").unwrap();
        catalog.insert("vcenter".into(), plugin);

        let err = plan_sync(&catalog, &[]).unwrap_err();
        assert!(matches!(err, PluginError::NameMismatch { .. }));
    }

    #[test]
    fn shared_schema_is_rejected() {
        let err = plan_sync(
            &discovered(&[("alpha", "1.0.0", "shared"), ("beta", "1.0.0", "shared")]),
            &[],
        )
        .unwrap_err();
        assert!(matches!(err, PluginError::SchemaNameConflict { .. }));
    }

    #[test]
    fn stale_record_keeps_its_schema() {
        let err = plan_sync(
            &discovered(&[("alpha", "1.0.0", "inventory")]),
            &[record("ghost", "1.0.0", "inventory", false)],
        )
        .unwrap_err();
        match err {
            PluginError::SchemaNameConflict { schema, .. } => assert_eq!(schema, "inventory"),
            other => panic!("unexpected error: {other}"),
        }
    }
}
