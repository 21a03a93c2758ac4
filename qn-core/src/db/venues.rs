//! Venue, city and country queries. All functions take a plain
//! `&Connection` so they run equally inside or outside a transaction.

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use uuid::Uuid;

use crate::common::error::Result;
use crate::domain::{City, Country, Venue};
use crate::normalize::distance_m;

use super::{fmt_ts, opt_ts_col, opt_uuid_col, ts_col, uuid_col};

const VENUE_COLS: &str = "id, name, normalized_name, slug, address, latitude, longitude, \
     postcode, place_id, city_id, phone, website, created_at, deleted_at, merged_into_id, deleted_by";

fn row_to_venue(row: &Row<'_>) -> rusqlite::Result<Venue> {
    Ok(Venue {
        id: uuid_col(row, 0)?,
        name: row.get(1)?,
        normalized_name: row.get(2)?,
        slug: row.get(3)?,
        address: row.get(4)?,
        latitude: row.get(5)?,
        longitude: row.get(6)?,
        postcode: row.get(7)?,
        place_id: row.get(8)?,
        city_id: uuid_col(row, 9)?,
        phone: row.get(10)?,
        website: row.get(11)?,
        created_at: ts_col(row, 12)?,
        deleted_at: opt_ts_col(row, 13)?,
        merged_into_id: opt_uuid_col(row, 14)?,
        deleted_by: row.get(15)?,
    })
}

pub fn insert_venue(conn: &Connection, venue: &Venue) -> Result<()> {
    conn.execute(
        "INSERT INTO venues (id, name, normalized_name, slug, address, latitude, longitude, \
         postcode, place_id, city_id, phone, website, created_at) \
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)",
        params![
            venue.id.to_string(),
            venue.name,
            venue.normalized_name,
            venue.slug,
            venue.address,
            venue.latitude,
            venue.longitude,
            venue.postcode,
            venue.place_id,
            venue.city_id.to_string(),
            venue.phone,
            venue.website,
            fmt_ts(venue.created_at),
        ],
    )?;
    Ok(())
}

pub fn get_venue(conn: &Connection, id: Uuid) -> Result<Option<Venue>> {
    let sql = format!("SELECT {VENUE_COLS} FROM venues WHERE id = ?1");
    let venue = conn
        .query_row(&sql, params![id.to_string()], row_to_venue)
        .optional()?;
    Ok(venue)
}

pub fn find_by_place_id(conn: &Connection, place_id: &str) -> Result<Option<Venue>> {
    let sql =
        format!("SELECT {VENUE_COLS} FROM venues WHERE place_id = ?1 AND deleted_at IS NULL");
    let venue = conn
        .query_row(&sql, params![place_id], row_to_venue)
        .optional()?;
    Ok(venue)
}

pub fn find_by_slug(conn: &Connection, slug: &str) -> Result<Option<Venue>> {
    let sql = format!("SELECT {VENUE_COLS} FROM venues WHERE slug = ?1");
    let venue = conn
        .query_row(&sql, params![slug], row_to_venue)
        .optional()?;
    Ok(venue)
}

pub fn slug_exists(conn: &Connection, slug: &str) -> Result<bool> {
    let count: i64 = conn.query_row(
        "SELECT COUNT(*) FROM venues WHERE slug = ?1",
        params![slug],
        |r| r.get(0),
    )?;
    Ok(count > 0)
}

/// Non-deleted venues within `radius_m` of the point, closest first,
/// optionally scoped to one city. Bounding-box prefilter in SQL, exact
/// distance in Rust. The threshold absorbs GPS jitter so exact coordinate
/// equality is never required.
pub fn find_nearby(
    conn: &Connection,
    lat: f64,
    lng: f64,
    radius_m: f64,
    city_id: Option<Uuid>,
) -> Result<Vec<(f64, Venue)>> {
    // ~111_111 m per degree of latitude; widen longitude by cos(lat).
    let lat_delta = radius_m / 111_111.0;
    let lng_delta = radius_m / (111_111.0 * lat.to_radians().cos().abs().max(0.01));

    let sql = format!(
        "SELECT {VENUE_COLS} FROM venues \
         WHERE deleted_at IS NULL \
           AND latitude BETWEEN ?1 AND ?2 \
           AND longitude BETWEEN ?3 AND ?4 \
           AND (?5 IS NULL OR city_id = ?5)"
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt.query_map(
        params![
            lat - lat_delta,
            lat + lat_delta,
            lng - lng_delta,
            lng + lng_delta,
            city_id.map(|c| c.to_string()),
        ],
        row_to_venue,
    )?;

    let mut matches = Vec::new();
    for row in rows {
        let venue = row?;
        if let (Some(vlat), Some(vlng)) = (venue.latitude, venue.longitude) {
            let dist = distance_m(lat, lng, vlat, vlng);
            if dist <= radius_m {
                matches.push((dist, venue));
            }
        }
    }
    matches.sort_by(|a, b| a.0.partial_cmp(&b.0).unwrap_or(std::cmp::Ordering::Equal));
    Ok(matches)
}

/// Venues whose normalized name is a substring of the query (or vice
/// versa). Postcode comparison happens in the caller.
pub fn find_by_name_substring(conn: &Connection, normalized_name: &str) -> Result<Vec<Venue>> {
    let sql = format!(
        "SELECT {VENUE_COLS} FROM venues \
         WHERE deleted_at IS NULL \
           AND (instr(?1, normalized_name) > 0 OR instr(normalized_name, ?1) > 0)"
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt.query_map(params![normalized_name], row_to_venue)?;
    let mut venues = Vec::new();
    for row in rows {
        venues.push(row?);
    }
    Ok(venues)
}

/// Last-resort fallback: case-insensitive substring match on name or
/// address.
pub fn find_by_name_or_address(
    conn: &Connection,
    normalized_name: &str,
    address: &str,
) -> Result<Option<Venue>> {
    let sql = format!(
        "SELECT {VENUE_COLS} FROM venues \
         WHERE deleted_at IS NULL \
           AND (instr(?1, normalized_name) > 0 OR instr(normalized_name, ?1) > 0 \
                OR (length(?2) > 0 AND instr(lower(address), ?2) > 0)) \
         ORDER BY created_at LIMIT 1"
    );
    let venue = conn
        .query_row(
            &sql,
            params![normalized_name, address.to_lowercase()],
            row_to_venue,
        )
        .optional()?;
    Ok(venue)
}

/// Fixed-size page of non-deleted venues in stable order, for batch scans.
pub fn list_active_page(conn: &Connection, limit: usize, offset: usize) -> Result<Vec<Venue>> {
    let sql = format!(
        "SELECT {VENUE_COLS} FROM venues WHERE deleted_at IS NULL \
         ORDER BY created_at, id LIMIT ?1 OFFSET ?2"
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt.query_map(params![limit as i64, offset as i64], row_to_venue)?;
    let mut venues = Vec::new();
    for row in rows {
        venues.push(row?);
    }
    Ok(venues)
}

pub fn count_active(conn: &Connection) -> Result<usize> {
    let count: i64 = conn.query_row(
        "SELECT COUNT(*) FROM venues WHERE deleted_at IS NULL",
        [],
        |r| r.get(0),
    )?;
    Ok(count as usize)
}

pub fn soft_delete(
    conn: &Connection,
    id: Uuid,
    merged_into: Uuid,
    deleted_by: &str,
    at: DateTime<Utc>,
) -> Result<()> {
    conn.execute(
        "UPDATE venues SET deleted_at = ?2, merged_into_id = ?3, deleted_by = ?4 WHERE id = ?1",
        params![
            id.to_string(),
            fmt_ts(at),
            merged_into.to_string(),
            deleted_by
        ],
    )?;
    Ok(())
}

pub fn restore(conn: &Connection, id: Uuid) -> Result<()> {
    conn.execute(
        "UPDATE venues SET deleted_at = NULL, merged_into_id = NULL, deleted_by = NULL WHERE id = ?1",
        params![id.to_string()],
    )?;
    Ok(())
}

/// Fill profile fields the stored venue is missing from a fresher sighting.
/// Never overwrites populated fields.
pub fn fill_missing_fields(
    conn: &Connection,
    id: Uuid,
    postcode: Option<&str>,
    place_id: Option<&str>,
    phone: Option<&str>,
    website: Option<&str>,
) -> Result<()> {
    conn.execute(
        "UPDATE venues SET \
            postcode = COALESCE(postcode, ?2), \
            place_id = COALESCE(place_id, ?3), \
            phone    = COALESCE(phone, ?4), \
            website  = COALESCE(website, ?5) \
         WHERE id = ?1",
        params![id.to_string(), postcode, place_id, phone, website],
    )?;
    Ok(())
}

pub fn find_or_create_country(conn: &Connection, name: &str, code: &str) -> Result<Country> {
    let existing = conn
        .query_row(
            "SELECT id, name, code FROM countries WHERE code = ?1",
            params![code],
            |row| {
                Ok(Country {
                    id: uuid_col(row, 0)?,
                    name: row.get(1)?,
                    code: row.get(2)?,
                })
            },
        )
        .optional()?;
    if let Some(country) = existing {
        return Ok(country);
    }
    let country = Country {
        id: Uuid::new_v4(),
        name: name.to_string(),
        code: code.to_string(),
    };
    conn.execute(
        "INSERT INTO countries (id, name, code) VALUES (?1, ?2, ?3)",
        params![country.id.to_string(), country.name, country.code],
    )?;
    Ok(country)
}

pub fn find_or_create_city(conn: &Connection, name: &str, country_id: Uuid) -> Result<City> {
    let normalized = crate::normalize::normalize_name(name);
    let existing = conn
        .query_row(
            "SELECT id, name, normalized_name, country_id FROM cities \
             WHERE normalized_name = ?1 AND country_id = ?2",
            params![normalized, country_id.to_string()],
            |row| {
                Ok(City {
                    id: uuid_col(row, 0)?,
                    name: row.get(1)?,
                    normalized_name: row.get(2)?,
                    country_id: uuid_col(row, 3)?,
                })
            },
        )
        .optional()?;
    if let Some(city) = existing {
        return Ok(city);
    }
    let city = City {
        id: Uuid::new_v4(),
        name: name.to_string(),
        normalized_name: normalized,
        country_id,
    };
    conn.execute(
        "INSERT INTO cities (id, name, normalized_name, country_id) VALUES (?1, ?2, ?3, ?4)",
        params![
            city.id.to_string(),
            city.name,
            city.normalized_name,
            city.country_id.to_string()
        ],
    )?;
    Ok(city)
}

pub fn city_by_normalized_name(conn: &Connection, normalized: &str) -> Result<Option<City>> {
    let city = conn
        .query_row(
            "SELECT id, name, normalized_name, country_id FROM cities WHERE normalized_name = ?1",
            params![normalized],
            |row| {
                Ok(City {
                    id: uuid_col(row, 0)?,
                    name: row.get(1)?,
                    normalized_name: row.get(2)?,
                    country_id: uuid_col(row, 3)?,
                })
            },
        )
        .optional()?;
    Ok(city)
}
