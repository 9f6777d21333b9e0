//! Version floor enforcement for the provisioning tool.

use semver::Version;

use super::PreflightError;

/// Oldest provisioning tool release with the JSON output this crate parses.
pub const DEFAULT_MIN_PROVIDER_VERSION: &str = "1.6.0";

/// Compares the version reported by `program` against `minimum`.
///
/// A leading `v` and surrounding whitespace are ignored.
///
/// # Errors
///
/// Returns [`PreflightError::UnparsableVersion`] when `reported` is not a
/// semantic version and [`PreflightError::VersionTooOld`] when it is older
/// than `minimum`.
pub fn check_version(
    program: &str,
    reported: &str,
    minimum: &Version,
) -> Result<(), PreflightError> {
    let trimmed = reported.trim();
    let normalised = trimmed.strip_prefix('v').unwrap_or(trimmed);
    let found = Version::parse(normalised).map_err(|_| PreflightError::UnparsableVersion {
        program: program.to_owned(),
        found: reported.to_owned(),
    })?;

    if found < *minimum {
        return Err(PreflightError::VersionTooOld {
            program: program.to_owned(),
            found: found.to_string(),
            minimum: minimum.to_string(),
        });
    }
    Ok(())
}
