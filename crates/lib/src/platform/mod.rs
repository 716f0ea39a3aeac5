pub mod paths;

use std::fmt;

use serde::{Deserialize, Serialize};

/// Image platform in OCI terms (e.g. `linux/amd64`).
///
/// Recorded in published image manifests; the engine only ever builds for
/// the host platform.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ImagePlatform {
  pub os: String,
  pub architecture: String,
}

impl ImagePlatform {
  /// The platform of the running host, using OCI identifiers.
  pub fn host() -> Self {
    Self {
      os: oci_os(std::env::consts::OS).to_string(),
      architecture: oci_arch(std::env::consts::ARCH).to_string(),
    }
  }
}

impl fmt::Display for ImagePlatform {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{}/{}", self.os, self.architecture)
  }
}

fn oci_os(os: &str) -> &str {
  match os {
    "macos" => "darwin",
    other => other,
  }
}

fn oci_arch(arch: &str) -> &str {
  match arch {
    "x86_64" => "amd64",
    "aarch64" => "arm64",
    "x86" => "386",
    other => other,
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn rust_identifiers_map_to_oci() {
    assert_eq!(oci_arch("x86_64"), "amd64");
    assert_eq!(oci_arch("aarch64"), "arm64");
    assert_eq!(oci_os("macos"), "darwin");
    assert_eq!(oci_os("linux"), "linux");
  }

  #[test]
  fn display_is_os_slash_arch() {
    let platform = ImagePlatform {
      os: "linux".to_string(),
      architecture: "arm64".to_string(),
    };
    assert_eq!(platform.to_string(), "linux/arm64");
  }
}
