use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;

use chrono::{Datelike, NaiveDate, Weekday};
use sepa_core::SourceDescriptor;
use serde::Deserialize;

use crate::config::ConfigurationError;

#[derive(Debug, Deserialize)]
struct SourceTableFile {
    sources: BTreeMap<String, Vec<SourceDescriptor>>,
}

/// Static weekday → source table, loaded once per run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SourceTable {
    days: [Vec<SourceDescriptor>; 7],
}

impl SourceTable {
    pub fn load(path: &Path) -> Result<Self, ConfigurationError> {
        let text =
            std::fs::read_to_string(path).map_err(|source| ConfigurationError::SourceTableIo {
                path: path.display().to_string(),
                source,
            })?;
        Self::from_yaml_str(&text, &path.display().to_string())
    }

    pub fn from_yaml_str(text: &str, origin: &str) -> Result<Self, ConfigurationError> {
        let file: SourceTableFile =
            serde_yaml::from_str(text).map_err(|source| ConfigurationError::SourceTableParse {
                path: origin.to_string(),
                source,
            })?;

        let mut table = Self::default();
        for (key, sources) in file.sources {
            let weekday: Weekday = key
                .parse()
                .map_err(|_| ConfigurationError::UnknownWeekday(key.clone()))?;
            if let Some(index) = sources.iter().position(|s| s.url.trim().is_empty()) {
                return Err(ConfigurationError::EmptyUrl { weekday, index });
            }
            table.insert(weekday, sources);
        }
        Ok(table)
    }

    pub fn insert(&mut self, weekday: Weekday, sources: Vec<SourceDescriptor>) {
        self.days[weekday.num_days_from_monday() as usize] = sources;
    }

    pub fn sources_for(&self, weekday: Weekday) -> &[SourceDescriptor] {
        &self.days[weekday.num_days_from_monday() as usize]
    }

    /// Sources to ingest for `date`, in table order with repeated urls dropped.
    pub fn resolve(&self, date: NaiveDate) -> Result<Vec<SourceDescriptor>, ConfigurationError> {
        let weekday = date.weekday();
        let mut seen = BTreeSet::new();
        let sources: Vec<_> = self
            .sources_for(weekday)
            .iter()
            .filter(|s| seen.insert(s.url.clone()))
            .cloned()
            .collect();
        if sources.is_empty() {
            return Err(ConfigurationError::UnmappedWeekday { weekday, date });
        }
        Ok(sources)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sepa_core::{ArchiveFormat, RetailerGroup};

    const TABLE: &str = r#"
sources:
  Monday:
    - url: https://example.org/sepa_martes.zip
      retailer_group: sepa
      expected_format: zip
      label: sepa_martes
  tuesday:
    - url: https://example.org/sepa_martes.zip
      retailer_group: sepa
      expected_format: zip
    - url: https://example.org/sepa_martes.zip
      retailer_group: sepa
      expected_format: zip
    - url: https://example.org/extra.zip
      retailer_group: Generic
      expected_format: zip
"#;

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    #[test]
    fn resolves_by_weekday_of_any_date() {
        let table = SourceTable::from_yaml_str(TABLE, "inline").expect("table");

        let monday = table.resolve(date(2024, 10, 14)).expect("monday");
        assert_eq!(monday.len(), 1);
        assert_eq!(monday[0].url, "https://example.org/sepa_martes.zip");
        assert_eq!(monday[0].retailer_group, RetailerGroup::sepa());
        assert_eq!(monday[0].expected_format, ArchiveFormat::Zip);
        assert_eq!(monday[0].label.as_deref(), Some("sepa_martes"));

        let tuesday = table.resolve(date(2031, 1, 7)).expect("tuesday");
        assert_eq!(
            tuesday.iter().map(|s| s.url.as_str()).collect::<Vec<_>>(),
            vec!["https://example.org/sepa_martes.zip", "https://example.org/extra.zip"]
        );
        assert_eq!(tuesday[1].retailer_group, RetailerGroup::generic());
    }

    #[test]
    fn unmapped_weekday_is_a_configuration_error() {
        let table = SourceTable::from_yaml_str(TABLE, "inline").expect("table");
        let err = table.resolve(date(2024, 10, 16)).expect_err("wednesday");
        assert!(matches!(
            err,
            ConfigurationError::UnmappedWeekday { weekday: Weekday::Wed, .. }
        ));
    }

    #[test]
    fn rejects_bad_tables() {
        let unknown = "sources:\n  someday: []\n";
        assert!(matches!(
            SourceTable::from_yaml_str(unknown, "inline"),
            Err(ConfigurationError::UnknownWeekday(_))
        ));

        let empty_url =
            "sources:\n  friday:\n    - url: ' '\n      retailer_group: sepa\n      expected_format: zip\n";
        assert!(matches!(
            SourceTable::from_yaml_str(empty_url, "inline"),
            Err(ConfigurationError::EmptyUrl { weekday: Weekday::Fri, index: 0 })
        ));

        let bad_format =
            "sources:\n  friday:\n    - url: x\n      retailer_group: sepa\n      expected_format: rar\n";
        assert!(matches!(
            SourceTable::from_yaml_str(bad_format, "inline"),
            Err(ConfigurationError::SourceTableParse { .. })
        ));
    }

    #[test]
    fn bundled_table_covers_every_weekday() {
        let path = Path::new(env!("CARGO_MANIFEST_DIR")).join("../../sources.yaml");
        let table = SourceTable::load(&path).expect("bundled sources.yaml");
        for offset in 0..7 {
            let day = date(2024, 10, 13 + offset);
            assert!(table.resolve(day).is_ok(), "{day} resolves");
        }
        assert_eq!(
            table.resolve(date(2024, 10, 14)).expect("monday"),
            table.resolve(date(2024, 10, 15)).expect("tuesday")
        );
    }
}
