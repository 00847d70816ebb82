//! Upstream URL shapes and partition keys for the three identity kinds.
//!
//! Plain agency ORIs, state aggregates (`STATE_XX`), and the national
//! aggregate (`NATIONAL_US`) hit different path templates and map to
//! different circuit partitions.

/// Classified fetch target derived from a work item's ORI.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FetchTarget {
    /// A concrete agency, identified by its ORI.
    Agency {
        /// The agency ORI.
        ori: String,
    },
    /// A state-level aggregate identity.
    State {
        /// Two-letter state abbreviation.
        abbr: String,
    },
    /// The national aggregate identity.
    National,
}

impl FetchTarget {
    /// Classifies an ORI into its target kind.
    pub fn from_ori(ori: &str) -> Self {
        if ori == "NATIONAL_US" {
            Self::National
        } else if let Some(abbr) = ori.strip_prefix("STATE_") {
            Self::State { abbr: abbr.to_string() }
        } else {
            Self::Agency { ori: ori.to_string() }
        }
    }

    /// Path for the monthly offense-count range query.
    pub fn counts_path(&self, offense: &str) -> String {
        match self {
            Self::Agency { ori } => format!("/nibrs/agency/{ori}/{offense}"),
            Self::State { abbr } => format!("/nibrs/state/{abbr}/{offense}"),
            Self::National => format!("/nibrs/national/{offense}"),
        }
    }

    /// Path for the participation query, only meaningful for agencies.
    ///
    /// Aggregate identities have no participation series; callers skip the
    /// call entirely for them.
    pub fn participation_path(&self, from_year: i32, to_year: i32) -> Option<String> {
        match self {
            Self::Agency { ori } => {
                Some(format!("/participation/agency/{ori}/{from_year}/{to_year}"))
            },
            Self::State { .. } | Self::National => None,
        }
    }

    /// Circuit breaker partition key for this target.
    ///
    /// Agencies partition by the two-letter state prefix of the ORI, so a
    /// struggling state API region fails fast for every agency in it.
    pub fn partition(&self) -> String {
        match self {
            Self::Agency { ori } => ori.chars().take(2).collect(),
            Self::State { abbr } => abbr.clone(),
            Self::National => "US".to_string(),
        }
    }
}

/// Formats a `from`/`to` query pair covering a whole year range.
pub fn range_params(from_year: i32, to_year: i32) -> [(&'static str, String); 3] {
    [
        ("from", format!("01-{from_year}")),
        ("to", format!("12-{to_year}")),
        ("type", "counts".to_string()),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_identity_kinds() {
        assert_eq!(
            FetchTarget::from_ori("CA0010000"),
            FetchTarget::Agency { ori: "CA0010000".to_string() }
        );
        assert_eq!(
            FetchTarget::from_ori("STATE_CA"),
            FetchTarget::State { abbr: "CA".to_string() }
        );
        assert_eq!(FetchTarget::from_ori("NATIONAL_US"), FetchTarget::National);
    }

    #[test]
    fn counts_paths_per_kind() {
        assert_eq!(
            FetchTarget::from_ori("CA0010000").counts_path("V"),
            "/nibrs/agency/CA0010000/V"
        );
        assert_eq!(FetchTarget::from_ori("STATE_TX").counts_path("HOM"), "/nibrs/state/TX/HOM");
        assert_eq!(FetchTarget::from_ori("NATIONAL_US").counts_path("BUR"), "/nibrs/national/BUR");
    }

    #[test]
    fn participation_only_for_agencies() {
        assert_eq!(
            FetchTarget::from_ori("CA0010000").participation_path(2024, 2024).unwrap(),
            "/participation/agency/CA0010000/2024/2024"
        );
        assert!(FetchTarget::from_ori("STATE_CA").participation_path(2024, 2024).is_none());
        assert!(FetchTarget::from_ori("NATIONAL_US").participation_path(2024, 2024).is_none());
    }

    #[test]
    fn partitions_by_state_prefix() {
        assert_eq!(FetchTarget::from_ori("CA0010000").partition(), "CA");
        assert_eq!(FetchTarget::from_ori("STATE_NY").partition(), "NY");
        assert_eq!(FetchTarget::from_ori("NATIONAL_US").partition(), "US");
    }

    #[test]
    fn range_params_cover_full_months() {
        let params = range_params(2020, 2024);
        assert_eq!(params[0], ("from", "01-2020".to_string()));
        assert_eq!(params[1], ("to", "12-2024".to_string()));
        assert_eq!(params[2], ("type", "counts".to_string()));
    }
}
