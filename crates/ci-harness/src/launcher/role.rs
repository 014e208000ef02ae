use std::fmt;

use api_types::JobType;
use error_stack::Report;

use crate::error::HarnessError;
use crate::error::HarnessResult;

/// What a pod does inside its job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RoleKind {
    Single,
    /// `multi-pd-mix` replica with ordinal 0
    Master,
    Worker,
    Prefill,
    Decode,
    Router,
}

impl RoleKind {
    /// Hostname segment that marks the role in a `multi-pd-separation` job.
    pub fn segment(&self) -> &'static str {
        match self {
            RoleKind::Single => "single",
            RoleKind::Master | RoleKind::Worker => "node",
            RoleKind::Prefill => "prefill",
            RoleKind::Decode => "decode",
            RoleKind::Router => "router",
        }
    }
}

impl fmt::Display for RoleKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RoleKind::Single => "single",
            RoleKind::Master => "master",
            RoleKind::Worker => "worker",
            RoleKind::Prefill => "prefill",
            RoleKind::Decode => "decode",
            RoleKind::Router => "router",
        };
        f.write_str(name)
    }
}

/// Role and ordinal of the current pod, derived from its hostname.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NodeRole {
    pub kind: RoleKind,
    pub ordinal: u32,
}

impl NodeRole {
    /// Derive the role from a hostname such as `ci-ab12-prefill-1`.
    ///
    /// # Errors
    ///
    /// - [`HarnessError::InvalidHostname`] if a multi-node hostname has no
    ///   trailing ordinal or no role segment
    pub fn from_hostname(job_type: JobType, hostname: &str) -> HarnessResult<Self> {
        let invalid = || {
            Report::new(HarnessError::InvalidHostname {
                hostname: hostname.to_string(),
            })
        };
        match job_type {
            JobType::Single => Ok(Self {
                kind: RoleKind::Single,
                ordinal: 0,
            }),
            JobType::MultiPdMix => {
                let ordinal = parse_ordinal(hostname).ok_or_else(invalid)?;
                let kind = if ordinal == 0 {
                    RoleKind::Master
                } else {
                    RoleKind::Worker
                };
                Ok(Self { kind, ordinal })
            }
            JobType::MultiPdSeparation => {
                let ordinal = parse_ordinal(hostname).ok_or_else(invalid)?;
                let kind = role_segment(hostname).ok_or_else(invalid)?;
                Ok(Self { kind, ordinal })
            }
        }
    }

    /// The pod that drives the test client for its job.
    pub fn runs_tests(&self) -> bool {
        match self.kind {
            RoleKind::Single | RoleKind::Master => true,
            RoleKind::Router => self.ordinal == 0,
            RoleKind::Worker | RoleKind::Prefill | RoleKind::Decode => false,
        }
    }
}

impl fmt::Display for NodeRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.kind, self.ordinal)
    }
}

/// Numeric suffix after the last `-`.
pub(crate) fn parse_ordinal(hostname: &str) -> Option<u32> {
    let (_, suffix) = hostname.rsplit_once('-')?;
    suffix.parse().ok()
}

pub(crate) fn role_segment(hostname: &str) -> Option<RoleKind> {
    [RoleKind::Prefill, RoleKind::Decode, RoleKind::Router]
        .into_iter()
        .find(|kind| hostname.contains(&format!("-{}-", kind.segment())))
}
