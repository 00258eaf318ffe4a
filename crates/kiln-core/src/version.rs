//! Version string normalization.

use std::sync::OnceLock;

use regex::Regex;

fn version_re() -> &'static Regex {
    static VERSION_REGEX: OnceLock<Regex> = OnceLock::new();
    VERSION_REGEX.get_or_init(|| {
        Regex::new(
            r"^v?(?P<major>\d+)(?:\.(?P<minor>\d+))?(?:\.\d+)?(?:-[0-9A-Za-z.~-]+)?(?:\+[0-9A-Za-z.~-]+)?$",
        )
        .expect("Invalid version regex")
    })
}

/// Reduces a version string to `major.minor`.
///
/// Returns the normalized string and whether it differs from the input.
/// An empty input is passed through unchanged.
///
/// # Examples
///
/// ```
/// use kiln_core::strip_patch_version;
///
/// assert_eq!(strip_patch_version("3.10.5").unwrap(), ("3.10".to_owned(), true));
/// assert_eq!(strip_patch_version("3.10").unwrap(), ("3.10".to_owned(), false));
/// assert_eq!(strip_patch_version("").unwrap(), (String::new(), false));
/// assert!(strip_patch_version("not-a-version").is_err());
/// ```
pub fn strip_patch_version(version: &str) -> crate::Result<(String, bool)> {
    if version.is_empty() {
        return Ok((String::new(), false));
    }

    let malformed = || crate::Error::MalformedVersion(version.to_owned());
    let caps = version_re().captures(version).ok_or_else(malformed)?;

    let major: u64 = caps["major"].parse().map_err(|_| malformed())?;
    let minor: u64 = match caps.name("minor") {
        Some(m) => m.as_str().parse().map_err(|_| malformed())?,
        None => 0,
    };

    let stripped = format!("{major}.{minor}");
    let changed = stripped != version;
    Ok((stripped, changed))
}
