const ICE_SCHEMES: [&str; 4] = ["stun:", "stuns:", "turn:", "turns:"];

/// Adds a `stun:`/`turn:` scheme to an ICE URL that lacks one.
///
/// Entries that carry credentials are TURN relays, everything else is treated as STUN.
pub fn normalize_ice_url(url: &str, has_credentials: bool) -> String {
    let url = url.trim();
    if ICE_SCHEMES.iter().any(|scheme| url.starts_with(scheme)) {
        return url.to_string();
    }
    let scheme = if has_credentials { "turn:" } else { "stun:" };
    format!("{}{}", scheme, url)
}
