//! Combined entity identifiers.
//!
//! Everything crossing the wire uses the combined form `{agency_id}_{native_id}`.
//! The separator is the first underscore; the native part may itself contain
//! underscores (common in GTFS trip and block IDs).

/// Build the combined form. Returns an empty string when either part is empty,
/// matching the wire behavior for absent optional IDs.
pub fn form(agency_id: &str, native_id: &str) -> String {
    if agency_id.is_empty() || native_id.is_empty() {
        return String::new();
    }
    format!("{}_{}", agency_id, native_id)
}

/// Split a combined ID at the first underscore.
///
/// Malformed IDs (no underscore, empty agency or native part) return `None`;
/// the API layer maps that to a 500, the historical behavior for these
/// requests.
pub fn extract(combined: &str) -> Option<(&str, &str)> {
    let idx = combined.find('_')?;
    let (agency, rest) = combined.split_at(idx);
    let native = &rest[1..];
    if agency.is_empty() || native.is_empty() {
        return None;
    }
    Some((agency, native))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_form_and_extract_round_trip() {
        assert_eq!(extract(&form("unitrans", "22005")), Some(("unitrans", "22005")));
        assert_eq!(extract(&form("a", "b")), Some(("a", "b")));
    }

    #[test]
    fn test_form_empty_parts() {
        assert_eq!(form("", "22005"), "");
        assert_eq!(form("unitrans", ""), "");
        assert_eq!(form("", ""), "");
    }

    #[test]
    fn test_extract_native_keeps_underscores() {
        // Suffix underscores belong to the native ID
        assert_eq!(
            extract("unitrans_weekday_trip_07"),
            Some(("unitrans", "weekday_trip_07"))
        );
    }

    #[test]
    fn test_extract_malformed() {
        assert_eq!(extract("nounderscoreatall"), None);
        assert_eq!(extract("_22005"), None);
        assert_eq!(extract("unitrans_"), None);
        assert_eq!(extract(""), None);
        assert_eq!(extract("_"), None);
    }
}
