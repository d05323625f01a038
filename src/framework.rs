//! Target framework monikers and the compatibility rules needed to pick the
//! right item group out of a dependency package.

use std::cmp::Ordering;
use std::fmt::{Display, Formatter};
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Family {
    /// .NET Framework, `net48` and friends.
    NetFramework,
    NetStandard,
    /// .NET Core, including `net5.0` and later.
    NetCoreApp,
}

/// A parsed target framework such as `netstandard2.1` or `net472`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Framework {
    pub family: Family,
    pub version: (u32, u32, u32),
}

#[derive(Debug, thiserror::Error)]
#[error("Unrecognised target framework moniker '{0}'")]
pub struct FrameworkParseError(pub String);

impl Framework {
    pub const fn new(family: Family, major: u32, minor: u32) -> Self {
        Self {
            family,
            version: (major, minor, 0),
        }
    }

    /// The short folder name used inside packages, e.g. `lib/<folder>/`.
    pub fn folder_name(&self) -> String {
        let (major, minor, patch) = self.version;
        match self.family {
            Family::NetStandard => format!("netstandard{major}.{minor}"),
            Family::NetCoreApp if major >= 5 => format!("net{major}.{minor}"),
            Family::NetCoreApp => format!("netcoreapp{major}.{minor}"),
            Family::NetFramework if patch > 0 => format!("net{major}{minor}{patch}"),
            Family::NetFramework => format!("net{major}{minor}"),
        }
    }

    /// Highest netstandard version that `self` can consume.
    fn supported_netstandard(&self) -> Option<(u32, u32, u32)> {
        let v = self.version;
        match self.family {
            Family::NetStandard => Some(v),
            Family::NetCoreApp if v >= (3, 0, 0) => Some((2, 1, 0)),
            Family::NetCoreApp if v >= (2, 0, 0) => Some((2, 0, 0)),
            Family::NetCoreApp => Some((1, 6, 0)),
            Family::NetFramework if v >= (4, 6, 1) => Some((2, 0, 0)),
            Family::NetFramework if v >= (4, 6, 0) => Some((1, 3, 0)),
            Family::NetFramework if v >= (4, 5, 1) => Some((1, 2, 0)),
            Family::NetFramework if v >= (4, 5, 0) => Some((1, 1, 0)),
            Family::NetFramework => None,
        }
    }

    /// Whether a project targeting `self` can use assets built for `other`.
    pub fn is_compatible_with(&self, other: &Framework) -> bool {
        if self.family == other.family {
            return other.version <= self.version;
        }
        match other.family {
            Family::NetStandard => self
                .supported_netstandard()
                .is_some_and(|max| other.version <= max),
            _ => false,
        }
    }

    /// Picks the best candidate for `self`: the highest compatible version of
    /// the same family, otherwise the highest compatible netstandard.
    pub fn nearest<'a, T>(
        &self,
        candidates: impl IntoIterator<Item = &'a T>,
        framework_of: impl Fn(&T) -> Option<Framework>,
    ) -> Option<&'a T>
    where
        T: 'a,
    {
        candidates
            .into_iter()
            .filter_map(|candidate| framework_of(candidate).map(|fw| (fw, candidate)))
            .filter(|(fw, _)| self.is_compatible_with(fw))
            .max_by(|(a, _), (b, _)| self.rank(a).cmp(&self.rank(b)))
            .map(|(_, candidate)| candidate)
    }

    fn rank(&self, candidate: &Framework) -> (u8, (u32, u32, u32)) {
        let family = if candidate.family == self.family { 1 } else { 0 };
        (family, candidate.version)
    }
}

fn parse_dotted(s: &str) -> Option<(u32, u32, u32)> {
    let mut parts = s.split('.').map(|p| p.parse::<u32>());
    let major = parts.next()?.ok()?;
    let minor = parts.next().unwrap_or(Ok(0)).ok()?;
    let patch = parts.next().unwrap_or(Ok(0)).ok()?;
    if parts.next().is_some() {
        return None;
    }
    Some((major, minor, patch))
}

fn parse_compact(s: &str) -> Option<(u32, u32, u32)> {
    if s.is_empty() || s.len() > 3 || !s.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    let digit = |i: usize| s.as_bytes().get(i).map_or(0, |b| u32::from(b - b'0'));
    Some((digit(0), digit(1), digit(2)))
}

impl FromStr for Framework {
    type Err = FrameworkParseError;

    fn from_str(moniker: &str) -> Result<Self, Self::Err> {
        let lower = moniker.trim().to_ascii_lowercase();
        let err = || FrameworkParseError(moniker.to_string());

        let (family, version) = if let Some(rest) = lower.strip_prefix("netstandard") {
            (Family::NetStandard, parse_dotted(rest))
        } else if let Some(rest) = lower.strip_prefix("netcoreapp") {
            (Family::NetCoreApp, parse_dotted(rest))
        } else if let Some(rest) = lower.strip_prefix("net") {
            if rest.contains('.') {
                let version = parse_dotted(rest).filter(|v| v.0 >= 5);
                (Family::NetCoreApp, version)
            } else {
                (Family::NetFramework, parse_compact(rest))
            }
        } else {
            return Err(err());
        };

        version
            .map(|version| Framework { family, version })
            .ok_or_else(err)
    }
}

impl Display for Framework {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.folder_name())
    }
}

impl PartialOrd for Framework {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Framework {
    fn cmp(&self, other: &Self) -> Ordering {
        (self.family, self.version).cmp(&(other.family, other.version))
    }
}

impl Serialize for Framework {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.folder_name())
    }
}

impl<'de> Deserialize<'de> for Framework {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let moniker = String::deserialize(deserializer)?;
        moniker.parse().map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fw(s: &str) -> Framework {
        s.parse().unwrap()
    }

    #[test]
    fn test_parse_and_folder_names() {
        for moniker in [
            "netstandard2.0",
            "netstandard2.1",
            "netcoreapp3.1",
            "net6.0",
            "net472",
            "net48",
            "net35",
        ] {
            assert_eq!(fw(moniker).folder_name(), moniker);
        }
        assert_eq!(fw("NetStandard2.0").family, Family::NetStandard);
        assert_eq!(fw("net8.0").family, Family::NetCoreApp);
        assert_eq!(fw("net472").version, (4, 7, 2));
        assert!("net4.0".parse::<Framework>().is_err());
        assert!("portable-net45".parse::<Framework>().is_err());
        assert!("uap10.0".parse::<Framework>().is_err());
    }

    #[test]
    fn test_compatibility() {
        assert!(fw("netstandard2.1").is_compatible_with(&fw("netstandard2.0")));
        assert!(!fw("netstandard2.0").is_compatible_with(&fw("netstandard2.1")));
        assert!(fw("net472").is_compatible_with(&fw("netstandard2.0")));
        assert!(!fw("net472").is_compatible_with(&fw("netstandard2.1")));
        assert!(fw("net6.0").is_compatible_with(&fw("netstandard2.1")));
        assert!(fw("net6.0").is_compatible_with(&fw("netcoreapp3.1")));
        assert!(!fw("netstandard2.0").is_compatible_with(&fw("net472")));
        assert!(!fw("net6.0").is_compatible_with(&fw("net48")));
    }

    #[test]
    fn test_nearest_prefers_same_family() {
        let groups = ["netstandard1.3", "netstandard2.0", "net45", "net472", "net6.0"];

        let pick = |target: &str| {
            fw(target)
                .nearest(groups.iter(), |g| g.parse().ok())
                .copied()
        };

        assert_eq!(pick("net48"), Some("net472"));
        assert_eq!(pick("netstandard2.1"), Some("netstandard2.0"));
        assert_eq!(pick("netcoreapp3.1"), Some("netstandard2.0"));
        assert_eq!(pick("net8.0"), Some("net6.0"));
        assert_eq!(pick("net40"), None);
    }
}
