//! Platform detection for selecting the correct bottle.
//!
//! Bottles are keyed by platform tags of the form `<arch>_<os>`:
//! `arm64_sequoia`, `x86_64_sonoma`, `x86_64_linux`. When a formula has no
//! bottle for the detected tag the installer falls back to the universal
//! `all` bottle, then to the source archive (see
//! [`Formula::artifact_for`](crate::formula::Formula::artifact_for)).

#[cfg(target_os = "macos")]
use std::process::Command;

/// Homebrew uses "arm64" not "aarch64"
fn bottle_arch() -> &'static str {
    match std::env::consts::ARCH {
        "aarch64" => "arm64",
        other => other,
    }
}

/// Detect the bottle tag for the running system.
///
/// On macOS the OS name comes from `sw_vers`; if that fails the tag falls
/// back to a recent release, since newer systems run older bottles.
pub fn detect_bottle_tag() -> String {
    #[cfg(target_os = "macos")]
    {
        let os_name = macos_version()
            .map(|v| macos_name(&v))
            .unwrap_or("sonoma");
        format!("{}_{}", bottle_arch(), os_name)
    }

    #[cfg(not(target_os = "macos"))]
    {
        format!("{}_{}", bottle_arch(), std::env::consts::OS)
    }
}

#[cfg(target_os = "macos")]
fn macos_version() -> Option<String> {
    let output = Command::new("sw_vers")
        .arg("-productVersion")
        .output()
        .ok()?;
    let version = String::from_utf8(output.stdout).ok()?;
    Some(version.trim().to_string())
}

#[cfg(any(target_os = "macos", test))]
fn macos_name(version: &str) -> &'static str {
    // Parse major version
    let major: u32 = version
        .split('.')
        .next()
        .and_then(|s| s.parse().ok())
        .unwrap_or(0);

    match major {
        26 | 16 => "tahoe",
        15 => "sequoia",
        14 => "sonoma",
        13 => "ventura",
        12 => "monterey",
        11 => "big_sur",
        _ => "sonoma",
    }
}
