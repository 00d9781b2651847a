//! Forward/drop decision for each record
//!
//! Pass-all forwards everything. An allow-list keeps only SBS1 records whose
//! ICAO field (5th comma-separated field) is in the set; a record too short to
//! carry that field is dropped.

use marlink_metadata::{FilterMode, FilterPolicy, RecordFormat};
use std::collections::HashSet;

use crate::record::Record;

/// Zero-based position of the hex ident in an SBS1 line
const SBS1_ICAO_FIELD: usize = 4;

/// Compiled form of a [`FilterPolicy`]; cheap to evaluate per record
#[derive(Debug, Clone, Default)]
pub struct RecordFilter {
    allow: Option<HashSet<String>>,
}

impl RecordFilter {
    pub fn new(policy: &FilterPolicy, format: RecordFormat) -> Self {
        match policy.mode {
            FilterMode::AllowList if format.supports_allow_list() => Self {
                allow: Some(policy.normalized_identifiers().into_iter().collect()),
            },
            _ => Self::pass_all(),
        }
    }

    pub fn pass_all() -> Self {
        Self { allow: None }
    }

    #[cfg(test)]
    fn is_pass_all(&self) -> bool {
        self.allow.is_none()
    }

    pub fn should_forward(&self, record: &Record) -> bool {
        match &self.allow {
            None => true,
            Some(allow) => match sbs1_icao(record.as_str()) {
                Some(icao) => allow.contains(&icao),
                None => false,
            },
        }
    }
}

/// Upper-cased ICAO hex ident of an SBS1 line, if present
pub fn sbs1_icao(line: &str) -> Option<String> {
    let field = line.split(',').nth(SBS1_ICAO_FIELD)?.trim();
    if field.is_empty() {
        return None;
    }
    Some(field.to_uppercase())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn allow(ids: &[&str]) -> RecordFilter {
        RecordFilter::new(&FilterPolicy::allow_list(ids.iter().copied()), RecordFormat::Sbs1)
    }

    #[test]
    fn test_pass_all_forwards_everything() {
        let filter = RecordFilter::new(&FilterPolicy::pass_all(), RecordFormat::Sbs1);
        assert!(filter.is_pass_all());
        for line in ["MSG,3,1,1,A92F2D,1", "", "garbage", "!AIVDM,1,1,,A,x,0*00"] {
            assert!(filter.should_forward(&Record::new(line)));
        }
    }

    #[test]
    fn test_allow_list_matches_icao_field() {
        let filter = allow(&["A92F2D"]);
        assert!(filter.should_forward(&Record::new(
            "MSG,3,1,1,A92F2D,1,2024/01/01,12:00:00.000,2024/01/01,12:00:00.000,,35000"
        )));
        assert!(!filter.should_forward(&Record::new("MSG,3,1,1,DEADBE,1,2024/01/01")));
    }

    #[test]
    fn test_allow_list_is_case_insensitive() {
        let filter = allow(&["a92f2d"]);
        assert!(filter.should_forward(&Record::new("MSG,3,1,1,A92F2D,1")));
        assert!(filter.should_forward(&Record::new("MSG,3,1,1, a92f2d ,1")));
    }

    #[test]
    fn test_malformed_record_is_dropped() {
        let filter = allow(&["A92F2D"]);
        assert!(!filter.should_forward(&Record::new("MSG,3,1,1")));
        assert!(!filter.should_forward(&Record::new("")));
        assert!(!filter.should_forward(&Record::new("MSG,3,1,1,,1")));
    }

    #[test]
    fn test_exactly_five_fields() {
        let filter = allow(&["A92F2D"]);
        assert!(filter.should_forward(&Record::new("MSG,3,1,1,A92F2D")));
    }

    #[test]
    fn test_allow_list_ignored_for_nmea() {
        let filter = RecordFilter::new(&FilterPolicy::allow_list(["A92F2D"]), RecordFormat::Nmea);
        assert!(filter.is_pass_all());
        assert!(filter.should_forward(&Record::new("!AIVDM,1,1,,A,x,0*00")));
    }

    #[test]
    fn test_empty_allow_list_drops_everything() {
        let filter = allow(&[]);
        assert!(!filter.is_pass_all());
        assert!(!filter.should_forward(&Record::new("MSG,3,1,1,A92F2D,1")));
    }
}
