//! Test-well profiles selectable at startup.

use std::fmt;
use std::str::FromStr;

use thiserror::Error;

/// Named initial condition for the two valve actuators.
///
/// Chosen once at startup; the reset policy returns the loop to this
/// condition whenever a session is lost.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct WellProfile {
    /// Operator-facing name.
    pub name: &'static str,
    /// Initial opening of valve A.
    pub z_ca0: f64,
    /// Initial opening of valve B.
    pub z_cb0: f64,
}

impl WellProfile {
    pub const BM01_LAND: Self = Self {
        name: "BM01 Land",
        z_ca0: 0.4356,
        z_cb0: 0.0,
    };

    pub const BM02_DEEPWATER_MPD: Self = Self {
        name: "BM02 Deepwater MPD",
        z_ca0: 0.5871,
        z_cb0: 0.0,
    };

    pub const BM03_DEEPWATER_CML: Self = Self {
        name: "BM03 Deepwater CML",
        z_ca0: 0.5871,
        z_cb0: 0.0,
    };

    /// All profiles in menu order (selection 1, 2, 3).
    pub const ALL: [Self; 3] = [
        Self::BM01_LAND,
        Self::BM02_DEEPWATER_MPD,
        Self::BM03_DEEPWATER_CML,
    ];

    /// Looks up a profile by its 1-based menu number.
    ///
    /// # Errors
    ///
    /// Returns [`ProfileError::Selection`] outside `1..=3`.
    pub fn from_selection(selection: usize) -> Result<Self, ProfileError> {
        selection
            .checked_sub(1)
            .and_then(|i| Self::ALL.get(i).copied())
            .ok_or(ProfileError::Selection(selection))
    }
}

impl fmt::Display for WellProfile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name)
    }
}

/// Accepts a menu number (`"2"`), a full name (`"BM01 Land"`) or a name
/// prefix such as `"bm03"`, case-insensitively.
impl FromStr for WellProfile {
    type Err = ProfileError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if let Ok(n) = s.parse::<usize>() {
            return Self::from_selection(n);
        }
        let wanted = s.to_ascii_lowercase();
        Self::ALL
            .into_iter()
            .find(|p| {
                let name = p.name.to_ascii_lowercase();
                !wanted.is_empty() && (name == wanted || name.starts_with(&wanted))
            })
            .ok_or_else(|| ProfileError::Name(s.to_owned()))
    }
}

/// Invalid profile selection.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProfileError {
    #[error("invalid selection {0}: enter 1, 2, or 3")]
    Selection(usize),
    #[error("unknown well profile: {0:?}")]
    Name(String),
}
