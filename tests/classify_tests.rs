//! Filename classification against the default CRM tables

use crm_elt::classify::RejectReason;
use crm_elt::{Classification, FilenameClassifier, PipelineConfig, TableRegistry};

fn classifier(year: i32) -> FilenameClassifier {
    FilenameClassifier::new(&TableRegistry::crm_defaults(), ".xlsx", "crm_", year)
}

#[test]
fn test_partitioned_file_for_another_year_is_rejected() {
    for (file, year) in [
        ("buyers_2025.xlsx", 2025),
        ("leads_2027.xlsx", 2027),
        ("events_1999.xlsx", 1999),
    ] {
        assert_eq!(
            classifier(2026).classify(file),
            Classification::Reject(RejectReason::StaleYear { year }),
            "{}",
            file
        );
    }
}

#[test]
fn test_every_partitioned_table_accepts_current_year() {
    let registry = TableRegistry::crm_defaults();
    let c = classifier(2026);
    for table in registry.iter().filter(|t| t.year_partitioned) {
        let base = table.name.trim_start_matches("crm_");
        let file = format!("{}_2026.xlsx", base);
        assert_eq!(c.classify(&file).table(), Some(table.name.as_str()));
    }
}

#[test]
fn test_unpartitioned_source_ignores_year() {
    for year in [2000, 2025, 2026, 2050] {
        assert_eq!(
            classifier(year).classify("all_properties.xlsx"),
            Classification::Table {
                table: "crm_properties".to_string(),
                partition_year: None,
            }
        );
    }
}

#[test]
fn test_classifier_follows_config() {
    let mut config = PipelineConfig::default();
    config.source.extension = ".csv".to_string();
    let registry = config.registry().unwrap();
    let c = FilenameClassifier::from_config(&config, &registry, 2026);

    assert!(c.classify("leads_2026.csv").is_accepted());
    assert!(!c.classify("leads_2026.xlsx").is_accepted());
}
