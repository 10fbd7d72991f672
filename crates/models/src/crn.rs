use std::fmt::{self, Display};
use std::str::FromStr;

/// Number of colon-delimited components of a fully-qualified CRN,
/// including the leading `crn` literal.
const SEGMENTS: usize = 10;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum CrnError {
    #[error("CRN must begin with 'crn': '{0}'")]
    MissingPrefix(String),
    #[error("CRN must have {SEGMENTS} colon-delimited components, got {1}: '{0}'")]
    WrongSegmentCount(String, usize),
}

/// Crn is a parsed Cloud Resource Name:
/// `crn:version:cname:ctype:service-name:location:scope:service-instance:resource-type:resource`.
///
/// A Crn may also represent a mask, where individual components are `*`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Crn {
    segments: Vec<String>,
}

impl Crn {
    /// Match `self` against a mask. Every component must be equal, or the
    /// mask component must be the `*` wildcard. An empty mask component
    /// matches only an empty component.
    pub fn matches_mask(&self, mask: &Crn) -> bool {
        self.segments
            .iter()
            .zip(mask.segments.iter())
            .all(|(have, want)| want == "*" || have == want)
    }

    pub fn version(&self) -> &str {
        &self.segments[1]
    }

    pub fn cname(&self) -> &str {
        &self.segments[2]
    }

    pub fn ctype(&self) -> &str {
        &self.segments[3]
    }

    pub fn service_name(&self) -> &str {
        &self.segments[4]
    }

    pub fn location(&self) -> &str {
        &self.segments[5]
    }
}

impl FromStr for Crn {
    type Err = CrnError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let segments: Vec<String> = s.split(':').map(str::to_string).collect();

        if segments.len() != SEGMENTS {
            return Err(CrnError::WrongSegmentCount(s.to_string(), segments.len()));
        }
        if segments[0] != "crn" {
            return Err(CrnError::MissingPrefix(s.to_string()));
        }
        Ok(Crn { segments })
    }
}

impl Display for Crn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.segments.join(":"))
    }
}
