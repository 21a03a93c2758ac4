//! Text normalization shared by the resolver, the duplicate detector and
//! the canonical store.

/// Normalize a venue name for matching: strip parenthetical suffixes
/// ("The Railway (Back Room)" -> "the railway"), case-fold, and collapse
/// whitespace.
pub fn normalize_name(name: &str) -> String {
    let stripped = strip_parenthetical(name);
    stripped
        .to_lowercase()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

/// Drop a trailing parenthetical qualifier, if any. Only the suffix form is
/// stripped; parentheses embedded mid-name are left alone.
pub fn strip_parenthetical(name: &str) -> &str {
    let trimmed = name.trim_end();
    if !trimmed.ends_with(')') {
        return name;
    }
    match trimmed.rfind('(') {
        Some(open) if open > 0 => trimmed[..open].trim_end(),
        _ => name,
    }
}

/// Postcodes compare with case and whitespace stripped.
pub fn normalize_postcode(postcode: &str) -> String {
    postcode
        .chars()
        .filter(|c| !c.is_whitespace())
        .collect::<String>()
        .to_uppercase()
}

/// URL-safe slug fragment: lowercase alphanumerics joined by hyphens.
pub fn slugify(text: &str) -> String {
    let mut slug = String::with_capacity(text.len());
    let mut last_was_hyphen = true;
    for c in text.to_lowercase().chars() {
        if c.is_ascii_alphanumeric() {
            slug.push(c);
            last_was_hyphen = false;
        } else if !last_was_hyphen {
            slug.push('-');
            last_was_hyphen = true;
        }
    }
    while slug.ends_with('-') {
        slug.pop();
    }
    slug
}

/// Distance in meters between two coordinates. Equirectangular
/// approximation, plenty for the sub-kilometer radii the resolver uses.
pub fn distance_m(lat1: f64, lng1: f64, lat2: f64, lng2: f64) -> f64 {
    const EARTH_RADIUS_M: f64 = 6_371_000.0;
    let lat_mid = ((lat1 + lat2) / 2.0).to_radians();
    let d_lat = (lat2 - lat1).to_radians();
    let d_lng = (lng2 - lng1).to_radians() * lat_mid.cos();
    (d_lat * d_lat + d_lng * d_lng).sqrt() * EARTH_RADIUS_M
}
