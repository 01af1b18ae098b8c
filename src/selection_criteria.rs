//! Criteria for selecting which server an operation runs on.

use std::{collections::HashMap, sync::Arc, time::Duration};

use derive_where::derive_where;
use serde::{Deserialize, Serialize};
use typed_builder::TypedBuilder;

use crate::sdam::{ServerAddress, ServerDescription, WIRE_VERSION_5_0};

/// Describes which servers are suitable for a given operation.
#[derive(Clone)]
#[derive_where(Debug)]
#[non_exhaustive]
pub enum SelectionCriteria {
    /// A read preference that describes the suitable servers based on the server type, max
    /// staleness, and server tags.
    ReadPreference(ReadPreference),

    /// A predicate used to filter servers that are considered suitable. A `server` will be
    /// considered suitable by a `predicate` if `predicate(server)` returns true.
    Predicate(#[derive_where(skip)] Predicate),
}

impl PartialEq for SelectionCriteria {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::ReadPreference(r1), Self::ReadPreference(r2)) => r1 == r2,
            _ => false,
        }
    }
}

impl From<ReadPreference> for SelectionCriteria {
    fn from(read_pref: ReadPreference) -> Self {
        Self::ReadPreference(read_pref)
    }
}

impl SelectionCriteria {
    /// The read preference this criteria wraps, if it is not a custom predicate.
    pub fn as_read_pref(&self) -> Option<&ReadPreference> {
        match self {
            Self::ReadPreference(ref read_pref) => Some(read_pref),
            Self::Predicate(..) => None,
        }
    }

    /// A criteria that only matches the server at the given address.
    ///
    /// Selection still routes through the topology so that stale-server checks can fire for
    /// servers that have since left the cluster.
    pub fn from_address(address: ServerAddress) -> Self {
        SelectionCriteria::Predicate(Arc::new(move |server| server.address == address))
    }
}

/// A predicate used to filter servers that are considered suitable.
pub type Predicate = Arc<dyn Send + Sync + Fn(&ServerDescription) -> bool>;

/// A set of tags used to match replica set members during server selection.
pub type TagSet = HashMap<String, String>;

/// Specifies how the driver should route a read operation to members of a replica set.
///
/// If applicable, `tag_sets` can be used to target specific nodes in a replica set, and
/// `max_staleness` specifies the maximum lag behind the primary that a secondary can be to
/// remain eligible for the operation.
///
/// See the [MongoDB docs](https://www.mongodb.com/docs/manual/core/read-preference) for more details.
#[allow(missing_docs)]
#[derive(Clone, Debug, PartialEq)]
#[non_exhaustive]
pub enum ReadPreference {
    /// Only route this operation to the primary.
    Primary,

    /// Only route this operation to a secondary.
    Secondary {
        options: Option<ReadPreferenceOptions>,
    },

    /// Route this operation to the primary if it's available, but fall back to the secondaries
    /// if not.
    PrimaryPreferred {
        options: Option<ReadPreferenceOptions>,
    },

    /// Route this operation to a secondary if one is available, but fall back to the primary if
    /// not.
    SecondaryPreferred {
        options: Option<ReadPreferenceOptions>,
    },

    /// Route this operation to the node with the least network latency regardless of whether
    /// it's the primary or a secondary.
    Nearest {
        options: Option<ReadPreferenceOptions>,
    },
}

impl ReadPreference {
    pub(crate) fn mode(&self) -> &'static str {
        match self {
            Self::Primary => "primary",
            Self::Secondary { .. } => "secondary",
            Self::PrimaryPreferred { .. } => "primaryPreferred",
            Self::SecondaryPreferred { .. } => "secondaryPreferred",
            Self::Nearest { .. } => "nearest",
        }
    }

    /// The options specified for this read preference, if any.
    pub fn options(&self) -> Option<&ReadPreferenceOptions> {
        match self {
            Self::Primary => None,
            Self::Secondary { options }
            | Self::PrimaryPreferred { options }
            | Self::SecondaryPreferred { options }
            | Self::Nearest { options } => options.as_ref(),
        }
    }
}

impl std::fmt::Display for ReadPreference {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut mode = self.mode().to_string();
        mode[0..1].make_ascii_uppercase();
        write!(f, "{{ Mode: {}", mode)?;

        if let Some(options) = self.options() {
            if let Some(ref tag_sets) = options.tag_sets {
                write!(f, ", Tag Sets: {:?}", tag_sets)?;
            }
            if let Some(ref max_staleness) = options.max_staleness {
                write!(f, ", Max Staleness: {:?}", max_staleness)?;
            }
        }

        write!(f, " }}")
    }
}

/// Specifies read preference options for non-primary read preferences.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize, TypedBuilder)]
#[builder(field_defaults(default, setter(into)))]
#[serde(rename_all = "camelCase")]
#[non_exhaustive]
pub struct ReadPreferenceOptions {
    /// Specifies which replica set members should be considered for operations. Each tag set
    /// will be checked in order until one or more servers is found with each tag in the set.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tag_sets: Option<Vec<TagSet>>,

    /// Specifies the maximum amount of lag behind the primary that a secondary can have to be
    /// considered for the given operation.
    #[serde(rename = "maxStalenessSeconds", skip_serializing_if = "Option::is_none")]
    pub max_staleness: Option<Duration>,
}

/// The criteria used for operations that may be routed to a secondary when the deployment is
/// new enough to accept writes there. Older deployments fall back to the primary.
pub(crate) fn secondary_writable_server_selector(
    common_wire_version: Option<i32>,
    read_preference: Option<&ReadPreference>,
) -> SelectionCriteria {
    match (common_wire_version, read_preference) {
        (Some(version), Some(read_pref)) if version >= WIRE_VERSION_5_0 => {
            SelectionCriteria::ReadPreference(read_pref.clone())
        }
        _ => SelectionCriteria::ReadPreference(ReadPreference::Primary),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sdam::ServerType;

    fn description(host: &str) -> ServerDescription {
        ServerDescription::builder()
            .address(ServerAddress::new(host, None))
            .server_type(ServerType::RsPrimary)
            .build()
    }

    #[test]
    fn address_criteria_matches_only_its_server() {
        let criteria = SelectionCriteria::from_address(ServerAddress::new("a.example.com", None));
        let predicate = match criteria {
            SelectionCriteria::Predicate(p) => p,
            _ => panic!("expected a predicate"),
        };
        assert!(predicate(&description("a.example.com")));
        assert!(!predicate(&description("b.example.com")));
    }

    #[test]
    fn secondary_writes_require_a_new_enough_deployment() {
        let read_pref = ReadPreference::SecondaryPreferred { options: None };

        let criteria = secondary_writable_server_selector(Some(WIRE_VERSION_5_0), Some(&read_pref));
        assert_eq!(criteria.as_read_pref(), Some(&read_pref));

        for wire_version in [None, Some(8)] {
            let criteria = secondary_writable_server_selector(wire_version, Some(&read_pref));
            assert_eq!(criteria.as_read_pref(), Some(&ReadPreference::Primary));
        }

        let criteria = secondary_writable_server_selector(Some(WIRE_VERSION_5_0), None);
        assert_eq!(criteria.as_read_pref(), Some(&ReadPreference::Primary));
    }

    #[test]
    fn read_preference_display_includes_options() {
        let read_pref = ReadPreference::Secondary {
            options: Some(
                ReadPreferenceOptions::builder()
                    .max_staleness(Some(Duration::from_secs(90)))
                    .build(),
            ),
        };
        let display = read_pref.to_string();
        assert!(display.starts_with("{ Mode: Secondary"));
        assert!(display.contains("Max Staleness"));
    }
}
