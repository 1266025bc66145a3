// API microversion model and negotiation state.
//
// The server advertises a [min, max] range of supported "major.minor"
// versions; the client pins one per instance and may lower it once through
// negotiation (see `negotiate.rs`). Versions compare numerically, so
// 1.9 < 1.31 -- string comparison would get this wrong.

use std::fmt;
use std::str::FromStr;

use crate::error::Error;

/// Latest API version this client was tested against; used when the caller
/// does not pin one.
pub const DEFAULT_API_VERSION: ApiVersion = ApiVersion { major: 1, minor: 9 };

/// Root path of the default API major version.
pub(crate) const API_ROOT: &str = "/v1";

/// A structured `major.minor` API microversion.
///
/// Ordering is numeric per component (derived from field order), which is
/// what version negotiation relies on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ApiVersion {
    pub major: u32,
    pub minor: u32,
}

impl ApiVersion {
    pub const fn new(major: u32, minor: u32) -> Self {
        Self { major, minor }
    }
}

impl fmt::Display for ApiVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.major, self.minor)
    }
}

impl FromStr for ApiVersion {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || Error::InvalidVersion(s.to_owned());
        let (major, minor) = s.split_once('.').ok_or_else(invalid)?;
        Ok(Self {
            major: major.parse().map_err(|_| invalid())?,
            minor: minor.parse().map_err(|_| invalid())?,
        })
    }
}

/// How the instance's API version was chosen.
///
/// Governs whether negotiation is permitted when the server rejects the
/// version with HTTP 406: `Default` and `Cached` may negotiate (once);
/// `User` never does; `Negotiated` means it already happened, so a second
/// 406 is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ApiVersionSelectState {
    /// No version pinned by the caller, none negotiated yet.
    #[default]
    Default,
    /// Caller pinned an explicit version.
    User,
    /// This instance has already negotiated once.
    Negotiated,
    /// A previously cached negotiated version was supplied at construction.
    Cached,
}

/// Write side of the external negotiated-version store, keyed by host:port.
///
/// The store itself (typically an on-disk cache shared between client
/// processes) is a collaborator; this crate only ever writes to it, right
/// after a successful negotiation. Last write wins.
pub trait VersionCache: Send + Sync {
    fn save(&self, host: &str, port: u16, version: ApiVersion);
}

/// Per-instance negotiation state, mutated only by `negotiate.rs`
/// (Default/Cached -> Negotiated) behind the client's lock.
#[derive(Debug, Clone)]
pub(crate) struct VersionState {
    pub select: ApiVersionSelectState,
    pub version: Option<ApiVersion>,
}

impl VersionState {
    pub(crate) fn requested_or_default(&self) -> ApiVersion {
        self.version.unwrap_or(DEFAULT_API_VERSION)
    }
}

/// Compute the version to fall back to: the smaller of requested and the
/// server's maximum, clamped up to the server's minimum.
pub(crate) fn clamp_negotiated(
    requested: ApiVersion,
    min: ApiVersion,
    max: ApiVersion,
) -> ApiVersion {
    let negotiated = requested.min(max);
    if negotiated < min { min } else { negotiated }
}
