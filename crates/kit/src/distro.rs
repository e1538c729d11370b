//! Distribution and architecture awareness
//!
//! Maps a (distribution, architecture) pair to the base cloud image to use,
//! the mirror URL it can be fetched from, and the osinfo os-variant string
//! consumed by virt-install. Pure resolution, no I/O.

use std::fmt;
use std::str::FromStr;

use color_eyre::eyre::eyre;
use serde::{Deserialize, Serialize};

/// Target CPU architecture for the VM
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
    strum::EnumIter,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum Arch {
    /// x86_64; KVM-accelerated on a typical host
    Amd64,
    /// aarch64; software-emulated when the host is x86_64
    Arm64,
}

impl Arch {
    /// The qemu binary architecture name passed to virt-install via `--arch`
    pub fn binary(self) -> &'static str {
        match self {
            Arch::Amd64 => "x86_64",
            Arch::Arm64 => "aarch64",
        }
    }
}

/// Distribution family
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
    strum::EnumIter,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum Family {
    Debian,
    Ubuntu,
}

/// A distribution release in `family/version` form, e.g. `debian/13` or
/// `ubuntu/24.04`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub struct Distro {
    pub family: Family,
    pub version: String,
}

impl Distro {
    pub fn new(family: Family, version: impl Into<String>) -> Self {
        Self {
            family,
            version: version.into(),
        }
    }

    /// The osinfo os-variant identifier for virt-install, e.g. `debian13`
    /// or `ubuntu24.04`.
    pub fn os_variant(&self) -> String {
        format!("{}{}", self.family, self.version)
    }
}

impl fmt::Display for Distro {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.family, self.version)
    }
}

impl FromStr for Distro {
    type Err = color_eyre::Report;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (family, version) = s
            .split_once('/')
            .ok_or_else(|| eyre!("Invalid distribution '{}'. Expected format: family/version", s))?;
        let family = Family::from_str(family)
            .map_err(|_| eyre!("Unknown distribution family '{}'. Supported: debian, ubuntu", family))?;
        if version.is_empty() {
            return Err(eyre!("Distribution version must not be empty"));
        }
        Ok(Distro::new(family, version))
    }
}

impl From<Distro> for String {
    fn from(d: Distro) -> String {
        d.to_string()
    }
}

impl TryFrom<String> for Distro {
    type Error = String;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse().map_err(|e: color_eyre::Report| e.to_string())
    }
}

/// Resolved base image for a (distribution, architecture) pair
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageSource {
    /// Image file name as stored in the shared image directory
    pub file_name: String,
    /// Mirror URL the image can be downloaded from
    pub url: String,
    /// osinfo os-variant string for virt-install
    pub os_variant: String,
}

/// Debian archive codename for a release version.
///
/// Unknown versions fall back to bookworm; this mirrors the mirror layout
/// where only the current stable and the release under test are indexed
/// by codename.
fn debian_codename(version: &str) -> &'static str {
    if version == "13" {
        "trixie"
    } else {
        "bookworm"
    }
}

/// Resolve the base cloud image for a (distribution, architecture) pair.
pub fn resolve(distro: &Distro, arch: Arch) -> ImageSource {
    let os_variant = distro.os_variant();
    match distro.family {
        Family::Ubuntu => {
            let file_name = format!("ubuntu-{}-server-cloudimg-{}.img", distro.version, arch);
            let url = format!(
                "https://cloud-images.ubuntu.com/releases/{}/release/{}",
                distro.version, file_name
            );
            ImageSource {
                file_name,
                url,
                os_variant,
            }
        }
        Family::Debian => {
            let codename = debian_codename(&distro.version);
            let file_name = format!("debian-{}-generic-{}.qcow2", distro.version, arch);
            let url = format!(
                "https://cdimage.debian.org/cdimage/cloud/{}/latest/{}",
                codename, file_name
            );
            ImageSource {
                file_name,
                url,
                os_variant,
            }
        }
    }
}
