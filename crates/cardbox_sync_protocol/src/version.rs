//! Protocol version constants and client compatibility gates.

/// The sync protocol version this server speaks.
pub const SYNC_VERSION: u8 = 10;

/// The oldest protocol version able to talk to a v2-scheduler collection.
///
/// Collections served here always report scheduler version 2, so clients
/// below this version are turned away with a structured upgrade message.
pub const MIN_SYNC_VERSION: u8 = 9;

/// Returns true if the client version string names a client known to be
/// too old to sync correctly.
///
/// The string has the shape `"<client>,<version>,<platform>"`, e.g.
/// `"ankidesktop,2.1.49,mac"`. Prerelease builds carry an `alpha`,
/// `beta` or `rc` marker directly inside the version component
/// (`"2.3alpha4"`). Unknown clients are assumed current.
pub fn client_too_old(cv: &str) -> bool {
    if cv.is_empty() {
        return false;
    }
    let mut parts = cv.split(',');
    let (Some(client), Some(version)) = (parts.next(), parts.next()) else {
        return false;
    };

    let (version, prerelease) = split_prerelease(version);
    let numbers = version_numbers(version);

    match client {
        "ankidesktop" => lt(&numbers, &[2, 0, 27]),
        "ankidroid" => {
            if numbers == [2, 3] {
                // the 2.3 alpha line fixed sync in alpha 4
                matches!(prerelease, Some(("alpha", n)) if n < 4)
            } else {
                lt(&numbers, &[2, 2, 3])
            }
        }
        _ => false,
    }
}

/// Splits a prerelease marker off a version component.
///
/// `"2.3alpha4"` becomes `("2.3", Some(("alpha", 4)))`. The marker only
/// counts when followed by digits, so platform-ish strings such as
/// `"2.1.15-arch"` (which contains `rc`) pass through untouched.
fn split_prerelease(version: &str) -> (&str, Option<(&'static str, u32)>) {
    for marker in ["alpha", "beta", "rc"] {
        if let Some(idx) = version.find(marker) {
            let rest = &version[idx + marker.len()..];
            if !rest.is_empty() && rest.bytes().all(|b| b.is_ascii_digit()) {
                if let Ok(n) = rest.parse() {
                    return (&version[..idx], Some((marker, n)));
                }
            }
        }
    }
    (version, None)
}

/// Parses the leading dotted-numeric part of a version component,
/// ignoring any non-numeric suffix.
fn version_numbers(version: &str) -> Vec<u32> {
    let numeric_len = version
        .find(|c: char| !c.is_ascii_digit() && c != '.')
        .unwrap_or(version.len());
    version[..numeric_len]
        .split('.')
        .filter_map(|p| p.parse().ok())
        .collect()
}

fn lt(version: &[u32], threshold: &[u32]) -> bool {
    version < threshold
}
