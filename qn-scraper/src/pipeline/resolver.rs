//! Entity resolution: decide whether a listing's venue is already known,
//! using a cascade of increasingly loose matching strategies, or create
//! it. All lookups are synchronous reads against the caller's connection
//! so the whole cascade can run inside the upsert transaction.

use chrono::Utc;
use rusqlite::Connection;
use tracing::{debug, info};
use uuid::Uuid;

use qn_core::db::venues;
use qn_core::domain::{Venue, VenueInput};
use qn_core::normalize::{normalize_name, normalize_postcode, slugify, strip_parenthetical};
use qn_core::{IngestError, Result};

use crate::config::ResolverConfig;
use crate::observability::metrics;

#[derive(Debug, Clone)]
pub enum Resolution {
    Found(Venue),
    Created(Venue),
}

impl Resolution {
    pub fn venue(&self) -> &Venue {
        match self {
            Resolution::Found(v) | Resolution::Created(v) => v,
        }
    }

    pub fn into_venue(self) -> Venue {
        match self {
            Resolution::Found(v) | Resolution::Created(v) => v,
        }
    }
}

pub struct VenueResolver {
    config: ResolverConfig,
}

impl VenueResolver {
    pub fn new(config: ResolverConfig) -> Self {
        Self { config }
    }

    /// Resolution cascade, first match wins:
    /// 1. exact external place id (authoritative)
    /// 2. geo-proximity within the configured radius, closest wins
    /// 3. normalized-name substring with matching stripped postcode
    /// 4. name/address substring fallback
    /// 5. create, with the unique slug constraint as the safety net
    ///    against concurrent creators
    pub fn resolve(&self, conn: &Connection, input: &VenueInput) -> Result<Resolution> {
        if let Some(place_id) = input.place_id.as_deref() {
            if let Some(venue) = venues::find_by_place_id(conn, place_id)? {
                metrics::resolver::matched_place_id();
                return Ok(Resolution::Found(venue));
            }
        }

        if let (Some(lat), Some(lng)) = (input.latitude, input.longitude) {
            let city_scope = self.city_scope(conn, input)?;
            let nearby = venues::find_nearby(conn, lat, lng, self.config.radius_m, city_scope)?;
            if let Some((dist, venue)) = nearby.into_iter().next() {
                debug!(venue = %venue.name, dist_m = dist, "proximity match");
                metrics::resolver::matched_proximity();
                return Ok(Resolution::Found(venue));
            }
        }

        let normalized = normalize_name(&input.name);
        if let Some(postcode) = input.postcode.as_deref() {
            let wanted = normalize_postcode(postcode);
            for candidate in venues::find_by_name_substring(conn, &normalized)? {
                let candidate_pc = candidate.postcode.as_deref().map(normalize_postcode);
                if candidate_pc.as_deref() == Some(wanted.as_str()) {
                    metrics::resolver::matched_name();
                    return Ok(Resolution::Found(candidate));
                }
            }
        }

        if let Some(venue) = venues::find_by_name_or_address(conn, &normalized, &input.address)? {
            metrics::resolver::matched_address();
            return Ok(Resolution::Found(venue));
        }

        self.create(conn, input, &normalized)
    }

    fn city_scope(&self, conn: &Connection, input: &VenueInput) -> Result<Option<Uuid>> {
        let Some(city_name) = input.city.as_deref() else {
            return Ok(None);
        };
        Ok(venues::city_by_normalized_name(conn, &normalize_name(city_name))?.map(|c| c.id))
    }

    fn create(
        &self,
        conn: &Connection,
        input: &VenueInput,
        normalized: &str,
    ) -> Result<Resolution> {
        // Locale is resolved at the extractor boundary; a listing that
        // reaches here without one cannot become a venue with a null city.
        let city_name = input.city.as_deref().ok_or_else(|| {
            IngestError::fatal(format!("missing city for new venue '{}'", input.name))
        })?;
        let country_code = input.country_code.as_deref().ok_or_else(|| {
            IngestError::fatal(format!("missing country for new venue '{}'", input.name))
        })?;

        let country = venues::find_or_create_country(conn, country_code, country_code)?;
        let city = venues::find_or_create_city(conn, city_name, country.id)?;

        let display_name = strip_parenthetical(&input.name).trim().to_string();
        let slug = self.unique_slug(conn, &display_name)?;
        let venue = Venue {
            id: Uuid::new_v4(),
            name: display_name,
            normalized_name: normalized.to_string(),
            slug,
            address: input.address.clone(),
            latitude: input.latitude,
            longitude: input.longitude,
            postcode: input.postcode.as_deref().map(normalize_postcode),
            place_id: input.place_id.clone(),
            city_id: city.id,
            phone: input.phone.clone(),
            website: input.website.clone(),
            created_at: Utc::now(),
            deleted_at: None,
            merged_into_id: None,
            deleted_by: None,
        };

        match venues::insert_venue(conn, &venue) {
            Ok(()) => {
                info!(venue = %venue.name, slug = %venue.slug, "created venue");
                metrics::resolver::venue_created();
                Ok(Resolution::Created(venue))
            }
            Err(IngestError::Conflict { message }) => {
                // Lost a creation race; the winner's row satisfies us
                debug!(message, "venue creation conflict, re-querying");
                metrics::resolver::conflict_recovered();
                self.recover_from_conflict(conn, input, &venue.slug)
            }
            Err(e) => Err(e),
        }
    }

    fn recover_from_conflict(
        &self,
        conn: &Connection,
        input: &VenueInput,
        slug: &str,
    ) -> Result<Resolution> {
        if let Some(place_id) = input.place_id.as_deref() {
            if let Some(venue) = venues::find_by_place_id(conn, place_id)? {
                return Ok(Resolution::Found(venue));
            }
        }
        if let Some(venue) = venues::find_by_slug(conn, slug)? {
            return Ok(Resolution::Found(venue));
        }
        Err(IngestError::Conflict {
            message: format!("venue conflict on '{slug}' but no surviving row found"),
        })
    }

    fn unique_slug(&self, conn: &Connection, name: &str) -> Result<String> {
        let base = slugify(name);
        if !venues::slug_exists(conn, &base)? {
            return Ok(base);
        }
        for n in 2..100 {
            let candidate = format!("{base}-{n}");
            if !venues::slug_exists(conn, &candidate)? {
                return Ok(candidate);
            }
        }
        Err(IngestError::Conflict {
            message: format!("could not find a free slug for '{base}'"),
        })
    }
}
