use crate::handlers::{PRUNE_AUDIT_LOG, TEST_EMAIL_CONFIG, UPDATE_PROPERTY_STATUS};
use crate::types::TaskParams;

/// One default task seeded by `TaskManager::create_default_tasks`.
///
/// `frequency` stays a raw label here so a bad entry is reported against
/// that entry alone instead of failing the whole bootstrap.
#[derive(Debug, Clone)]
pub struct CatalogEntry {
    pub name: String,
    pub task_type: String,
    pub description: String,
    pub frequency: String,
    pub parameters: TaskParams,
}

impl CatalogEntry {
    pub fn new(name: &str, task_type: &str, description: &str, frequency: &str, parameters: TaskParams) -> Self {
        Self {
            name: name.to_string(),
            task_type: task_type.to_string(),
            description: description.to_string(),
            frequency: frequency.to_string(),
            parameters,
        }
    }
}

/// The compiled-in default tasks.
pub fn default_catalog() -> Vec<CatalogEntry> {
    vec![
        CatalogEntry::new(
            "Recompute property status",
            UPDATE_PROPERTY_STATUS,
            "Mark each property occupied or vacant from the leases active today.",
            "DAILY",
            TaskParams::new(),
        ),
        CatalogEntry::new(
            "Send configuration test email",
            TEST_EMAIL_CONFIG,
            "Check that the outgoing mail relay accepts mail for the given recipient.",
            "MANUAL",
            TaskParams::new().with("recipient", "admin@localhost"),
        ),
        CatalogEntry::new(
            "Prune audit log",
            PRUNE_AUDIT_LOG,
            "Delete audit log entries older than the retention window.",
            "WEEKLY",
            TaskParams::new().with("retention_days", 90i64),
        ),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Frequency;
    use std::collections::HashSet;

    #[test]
    fn catalog_types_are_unique_and_labels_parse() {
        let catalog = default_catalog();
        let types: HashSet<&str> = catalog.iter().map(|e| e.task_type.as_str()).collect();
        assert_eq!(types.len(), catalog.len());
        for entry in &catalog {
            assert!(entry.frequency.parse::<Frequency>().is_ok(), "{}", entry.frequency);
        }
    }
}
