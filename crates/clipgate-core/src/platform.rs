//! Source platforms and URL-to-platform detection.
//!
//! Every download job targets exactly one platform. Slot ceilings are keyed
//! by [`Platform`], so adding a platform means adding a variant here and a
//! default ceiling; the scheduler itself never branches on the platform.

use std::fmt;
use std::str::FromStr;

use crate::error::GateError;

/// Upstream platform a job downloads from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, serde::Serialize, serde::Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum Platform {
    Rumble,
    Kick,
    Twitch,
    GoogleDrive,
    ZoomClip,
}

impl Platform {
    /// All known platforms, in a stable order (used for config defaults and stats).
    pub const ALL: [Platform; 5] = [
        Platform::Rumble,
        Platform::Kick,
        Platform::Twitch,
        Platform::GoogleDrive,
        Platform::ZoomClip,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Platform::Rumble => "rumble",
            Platform::Kick => "kick",
            Platform::Twitch => "twitch",
            Platform::GoogleDrive => "google-drive",
            Platform::ZoomClip => "zoom-clip",
        }
    }

    /// Default concurrent-download ceiling when config does not name the platform.
    pub fn default_max_slots(self) -> usize {
        match self {
            Platform::Rumble => 3,
            Platform::Kick => 2,
            Platform::Twitch => 3,
            Platform::GoogleDrive => 4,
            Platform::ZoomClip => 2,
        }
    }

    /// Detect the platform from a submitted URL.
    ///
    /// Only `http`/`https` URLs whose host belongs to a known platform are
    /// accepted; anything else is a permanent rejection.
    pub fn from_url(raw: &str) -> Result<Self, GateError> {
        let parsed = url::Url::parse(raw.trim()).map_err(|e| GateError::InvalidUrl {
            url: raw.to_string(),
            reason: e.to_string(),
        })?;
        if !matches!(parsed.scheme(), "http" | "https") {
            return Err(GateError::InvalidUrl {
                url: raw.to_string(),
                reason: format!("unsupported scheme {}", parsed.scheme()),
            });
        }
        let host = parsed
            .host_str()
            .ok_or_else(|| GateError::InvalidUrl {
                url: raw.to_string(),
                reason: "missing host".to_string(),
            })?
            .to_ascii_lowercase();

        let on = |domain: &str| host == domain || host.ends_with(&format!(".{domain}"));

        let platform = if on("rumble.com") {
            Platform::Rumble
        } else if on("kick.com") {
            Platform::Kick
        } else if on("twitch.tv") {
            Platform::Twitch
        } else if host == "drive.google.com" || host == "docs.google.com" {
            Platform::GoogleDrive
        } else if on("zoom.us") && parsed.path().contains("/clips/") {
            Platform::ZoomClip
        } else {
            return Err(GateError::InvalidUrl {
                url: raw.to_string(),
                reason: format!("host {host} is not a supported platform"),
            });
        };
        Ok(platform)
    }
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Platform {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Platform::ALL
            .into_iter()
            .find(|p| p.as_str() == s)
            .ok_or_else(|| format!("unknown platform: {s}"))
    }
}

impl TryFrom<String> for Platform {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Platform> for String {
    fn from(p: Platform) -> Self {
        p.as_str().to_string()
    }
}
