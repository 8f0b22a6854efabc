//! Static provider knowledge: instance types, shells and group naming

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Prefix of every security group this crate addresses
pub const SECURITY_GROUP_PREFIX: &str = "@cumulus";

/// Shared group every master node joins for administrative access
pub const MASTER_GROUP: &str = "@cumulus-masters";

/// Login shells the node configuration layer knows how to set up
pub const SUPPORTED_SHELLS: &[&str] = &["bash", "zsh", "csh", "ksh", "tcsh"];

/// CPU architecture of an image or instance type
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Architecture {
    /// 32-bit x86
    #[serde(rename = "i386")]
    I386,
    /// 64-bit x86
    #[serde(rename = "x86_64")]
    X86_64,
    /// 64-bit ARM
    #[serde(rename = "arm64")]
    Arm64,
}

impl fmt::Display for Architecture {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::I386 => write!(f, "i386"),
            Self::X86_64 => write!(f, "x86_64"),
            Self::Arm64 => write!(f, "arm64"),
        }
    }
}

impl FromStr for Architecture {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "i386" => Ok(Self::I386),
            "x86_64" => Ok(Self::X86_64),
            "arm64" => Ok(Self::Arm64),
            other => Err(format!(
                "unknown architecture: {other}, expected one of: i386, x86_64, arm64"
            )),
        }
    }
}

/// Instance types and the architecture each one runs
const INSTANCE_TYPES: &[(&str, Architecture)] = &[
    ("m1.small", Architecture::I386),
    ("c1.medium", Architecture::I386),
    ("m1.large", Architecture::X86_64),
    ("m1.xlarge", Architecture::X86_64),
    ("c1.xlarge", Architecture::X86_64),
    ("m2.xlarge", Architecture::X86_64),
    ("m2.2xlarge", Architecture::X86_64),
    ("m2.4xlarge", Architecture::X86_64),
    ("cc1.4xlarge", Architecture::X86_64),
    ("t4g.medium", Architecture::Arm64),
    ("m6g.large", Architecture::Arm64),
];

/// Architecture required by an instance type, `None` if the type is unknown
pub fn instance_architecture(instance_type: &str) -> Option<Architecture> {
    INSTANCE_TYPES
        .iter()
        .find(|(name, _)| *name == instance_type)
        .map(|(_, arch)| *arch)
}

/// All known instance type names
pub fn instance_types() -> impl Iterator<Item = &'static str> {
    INSTANCE_TYPES.iter().map(|(name, _)| *name)
}

/// Whether the node configuration layer supports a login shell
pub fn is_supported_shell(shell: &str) -> bool {
    SUPPORTED_SHELLS.contains(&shell)
}

/// Security group name for a cluster tag
pub fn security_group_name(cluster_tag: &str) -> String {
    format!("{SECURITY_GROUP_PREFIX}-{cluster_tag}")
}
