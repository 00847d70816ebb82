//! Defensive parsing of upstream count payloads.
//!
//! The upstream schema is not under our control: monthly series are
//! grouped under labels that vary by call shape ("Agency Offenses",
//! "Alabama Offenses", "United States Offenses", ...), and the whole
//! counts block is sometimes wrapped in an `offenses` envelope. Series
//! keys are therefore located by substring marker rather than exact name,
//! and a year's total is the sum of whatever months are present, missing
//! months counting as zero.

use serde_json::{Map, Value};

use crate::error::{FetchError, Result};

/// Marker for the offense-count series.
pub const OFFENSES_MARKER: &str = "Offenses";
/// Marker for the clearance-count series.
pub const CLEARANCES_MARKER: &str = "Clearances";

/// A year's worth of parsed counts and reference values.
#[derive(Debug, Clone, PartialEq)]
pub struct ParsedYear {
    /// Summed monthly offense counts.
    pub actual_count: i64,
    /// Whether any offense month carried data.
    pub has_offense_data: bool,
    /// Summed monthly clearance counts, when the series reported data.
    pub clearance_count: Option<i64>,
    /// Latest reported population for the year, if present.
    pub population: Option<i64>,
    /// Latest reported percent-of-population coverage, if present.
    pub coverage_pct: Option<f64>,
}

/// Parses one year out of a counts payload.
///
/// # Errors
///
/// Returns `FetchError::Parse` when the payload is not an object or has
/// no `actuals` block. A present block with no matching series is
/// tolerated and parses to zero.
pub fn parse_year(payload: &Value, year: i32) -> Result<ParsedYear> {
    let root = counts_root(payload)
        .ok_or_else(|| FetchError::parse("payload is not a JSON object"))?;

    let actuals = root
        .get("actuals")
        .and_then(Value::as_object)
        .ok_or_else(|| FetchError::parse("payload has no actuals block"))?;

    let (actual_count, has_offense_data) = marker_year_total(actuals, OFFENSES_MARKER, year);
    let (clearance_total, has_clearance_data) =
        marker_year_total(actuals, CLEARANCES_MARKER, year);

    let coverage = root
        .get("tooltips")
        .and_then(Value::as_object)
        .and_then(|t| t.get("Percent of Population Coverage"))
        .and_then(Value::as_object)
        .and_then(|d| latest_monthly_value(d, year));

    // Populations appear nested inside the counts root or at the payload
    // top level depending on call shape.
    let populations = root
        .get("populations")
        .or_else(|| payload.get("populations"))
        .and_then(Value::as_object)
        .and_then(|p| p.get("population"))
        .and_then(Value::as_object);
    let population = populations.and_then(|d| latest_monthly_value(d, year));

    Ok(ParsedYear {
        actual_count,
        has_offense_data,
        clearance_count: has_clearance_data.then_some(clearance_total),
        population: population.map(|v| v as i64),
        coverage_pct: coverage,
    })
}

/// Unwraps the optional `offenses` envelope around the counts block.
fn counts_root(payload: &Value) -> Option<&Map<String, Value>> {
    let map = payload.as_object()?;
    match map.get("offenses").and_then(Value::as_object) {
        Some(inner) => Some(inner),
        None => Some(map),
    }
}

/// Finds the first key containing `marker` as a substring.
pub fn find_key_containing<'a>(map: &'a Map<String, Value>, marker: &str) -> Option<&'a str> {
    map.keys().find(|k| k.contains(marker)).map(String::as_str)
}

/// Sums the monthly values of the series whose label contains `marker`,
/// restricted to `year`. Returns the total and whether any month carried
/// a numeric value. A missing series or missing months count as zero.
pub fn marker_year_total(map: &Map<String, Value>, marker: &str, year: i32) -> (i64, bool) {
    let Some(key) = find_key_containing(map, marker) else {
        return (0, false);
    };
    let Some(months) = map.get(key).and_then(Value::as_object) else {
        return (0, false);
    };

    let suffix = format!("-{year}");
    let mut total = 0.0_f64;
    let mut has_data = false;

    for (date_key, value) in months {
        if date_key.ends_with(&suffix) {
            if let Some(v) = value.as_f64() {
                total += v;
                has_data = true;
            }
        }
    }

    (total as i64, has_data)
}

/// Extracts the months-reported figure for `year` from a participation
/// payload. Returns `None` when the year is absent; participation is a
/// best-effort enrichment, never a fetch failure.
pub fn participation_months(payload: &Value, year: i32) -> Option<i32> {
    payload
        .get("results")
        .and_then(Value::as_array)?
        .iter()
        .find(|entry| entry.get("data_year").and_then(Value::as_i64) == Some(i64::from(year)))?
        .get("months_reported")
        .and_then(Value::as_i64)
        .map(|months| months as i32)
}

/// Latest non-null monthly value within `year` from a reference series
/// group (first series wins; labels vary by call shape here too).
pub fn latest_monthly_value(group: &Map<String, Value>, year: i32) -> Option<f64> {
    let months = group.values().next()?.as_object()?;

    for month in (1..=12).rev() {
        let key = format!("{month:02}-{year}");
        if let Some(value) = months.get(&key).and_then(Value::as_f64) {
            return Some(value);
        }
    }

    None
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn agency_payload() -> Value {
        json!({
            "actuals": {
                "Agency Offenses": {
                    "01-2024": 10, "02-2024": 10, "03-2024": 10, "04-2024": 10,
                    "05-2024": 10, "06-2024": 10, "07-2024": 10, "08-2024": 10,
                    "09-2024": 10, "10-2024": 10, "11-2024": 10, "12-2024": 10,
                    "12-2023": 99
                },
                "Agency Clearances": {
                    "01-2024": 2, "06-2024": 3
                }
            },
            "tooltips": {
                "Percent of Population Coverage": {
                    "Agency": { "03-2024": 97.5, "01-2024": 95.0 }
                }
            },
            "populations": {
                "population": {
                    "Agency": { "06-2024": 50000, "01-2024": 49000 }
                }
            }
        })
    }

    #[test]
    fn sums_months_for_target_year_only() {
        let parsed = parse_year(&agency_payload(), 2024).unwrap();
        assert_eq!(parsed.actual_count, 120);
        assert!(parsed.has_offense_data);
    }

    #[test]
    fn missing_months_count_as_zero() {
        let parsed = parse_year(&agency_payload(), 2024).unwrap();
        // Clearances reported only two months; the rest are zero.
        assert_eq!(parsed.clearance_count, Some(5));
    }

    #[test]
    fn year_without_data_is_zero_not_error() {
        let parsed = parse_year(&agency_payload(), 2019).unwrap();
        assert_eq!(parsed.actual_count, 0);
        assert!(!parsed.has_offense_data);
        assert_eq!(parsed.clearance_count, None);
    }

    #[test]
    fn finds_series_by_substring_across_call_shapes() {
        let state = json!({
            "actuals": {
                "Alabama Offenses": { "01-2024": 7 }
            }
        });
        let parsed = parse_year(&state, 2024).unwrap();
        assert_eq!(parsed.actual_count, 7);
    }

    #[test]
    fn unwraps_offenses_envelope() {
        let wrapped = json!({
            "offenses": {
                "actuals": {
                    "United States Offenses": { "04-2024": 3, "05-2024": 4 }
                }
            }
        });
        let parsed = parse_year(&wrapped, 2024).unwrap();
        assert_eq!(parsed.actual_count, 7);
    }

    #[test]
    fn reference_values_take_latest_month() {
        let parsed = parse_year(&agency_payload(), 2024).unwrap();
        assert_eq!(parsed.coverage_pct, Some(97.5));
        assert_eq!(parsed.population, Some(50000));
    }

    #[test]
    fn non_object_payload_is_a_parse_error() {
        let err = parse_year(&json!([1, 2, 3]), 2024).unwrap_err();
        assert!(matches!(err, FetchError::Parse { .. }));
    }

    #[test]
    fn missing_actuals_is_a_parse_error() {
        let err = parse_year(&json!({"results": []}), 2024).unwrap_err();
        assert!(matches!(err, FetchError::Parse { .. }));
    }

    #[test]
    fn participation_months_found_by_year() {
        let payload = json!({
            "results": [
                { "data_year": 2023, "months_reported": 11 },
                { "data_year": 2024, "months_reported": 12 }
            ]
        });
        assert_eq!(participation_months(&payload, 2024), Some(12));
        assert_eq!(participation_months(&payload, 2023), Some(11));
    }

    #[test]
    fn participation_missing_year_is_none() {
        let payload = json!({ "results": [{ "data_year": 2020, "months_reported": 9 }] });
        assert_eq!(participation_months(&payload, 2024), None);
        assert_eq!(participation_months(&json!({}), 2024), None);
    }

    #[test]
    fn null_months_are_tolerated() {
        let payload = json!({
            "actuals": {
                "Agency Offenses": { "01-2024": null, "02-2024": 5 }
            }
        });
        let parsed = parse_year(&payload, 2024).unwrap();
        assert_eq!(parsed.actual_count, 5);
        assert!(parsed.has_offense_data);
    }
}
