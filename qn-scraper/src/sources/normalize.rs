//! Turns source-shaped detail text into typed ingestion inputs. All
//! normalization happens here, once, at the extractor boundary; nothing
//! downstream re-parses text.

use chrono::NaiveTime;
use serde_json::json;

use qn_core::domain::{
    EventInput, Frequency, ListingInput, PerformerInput, RawDetail, VenueInput,
};
use qn_core::{IngestError, Result};

/// Parse free text like "Wednesday 20:00" or "thu 7:30pm" into an ISO
/// weekday (Monday = 1) and a start time.
pub fn parse_day_and_time(text: &str) -> Result<(u8, NaiveTime)> {
    let trimmed = text.trim();
    let mut parts = trimmed.split_whitespace();
    let day_word = parts.next().ok_or_else(|| IngestError::Validation {
        message: format!("empty time text: {text:?}"),
    })?;
    let time_word = parts.next().ok_or_else(|| IngestError::Validation {
        message: format!("time text missing start time: {text:?}"),
    })?;

    let day = parse_weekday(day_word).ok_or_else(|| IngestError::Validation {
        message: format!("unrecognized weekday in time text: {text:?}"),
    })?;
    let time = parse_start_time(time_word).ok_or_else(|| IngestError::Validation {
        message: format!("unparseable start time in time text: {text:?}"),
    })?;
    Ok((day, time))
}

fn parse_weekday(word: &str) -> Option<u8> {
    let lower = word.trim_matches(|c: char| !c.is_alphabetic()).to_lowercase();
    let day = match lower.as_str() {
        "monday" | "mon" => 1,
        "tuesday" | "tue" | "tues" => 2,
        "wednesday" | "wed" | "weds" => 3,
        "thursday" | "thu" | "thur" | "thurs" => 4,
        "friday" | "fri" => 5,
        "saturday" | "sat" => 6,
        "sunday" | "sun" => 7,
        _ => return None,
    };
    Some(day)
}

fn parse_start_time(word: &str) -> Option<NaiveTime> {
    use chrono::Timelike;

    let lower = word.to_lowercase();
    if let Some(stripped) = lower.strip_suffix("pm") {
        let t = parse_hm(stripped)?;
        // 12pm is noon; everything else shifts forward twelve hours
        return if t.hour() == 12 {
            Some(t)
        } else {
            t.with_hour(t.hour() + 12)
        };
    }
    if let Some(stripped) = lower.strip_suffix("am") {
        let t = parse_hm(stripped)?;
        // 12am is midnight
        return if t.hour() == 12 { t.with_hour(0) } else { Some(t) };
    }
    parse_hm(&lower)
}

fn parse_hm(text: &str) -> Option<NaiveTime> {
    if text.contains(':') {
        NaiveTime::parse_from_str(text, "%H:%M").ok()
    } else {
        NaiveTime::parse_from_str(&format!("{text}:00"), "%H:%M").ok()
    }
}

/// Parse fee text like "£2.50", "Free" or "2 pounds" into whole cents.
/// Returns None when the text carries no usable amount.
pub fn parse_fee_cents(text: &str) -> Option<i64> {
    let lower = text.trim().to_lowercase();
    if lower.is_empty() {
        return None;
    }
    if lower.contains("free") {
        return Some(0);
    }
    let digits: String = lower
        .chars()
        .filter(|c| c.is_ascii_digit() || *c == '.')
        .collect();
    if digits.is_empty() {
        return None;
    }
    let amount: f64 = digits.parse().ok()?;
    Some((amount * 100.0).round() as i64)
}

/// Map frequency text to the canonical enum. Unknown or missing text
/// defaults to weekly, the overwhelmingly common cadence for pub quizzes.
pub fn parse_frequency(text: Option<&str>) -> Frequency {
    let Some(text) = text else {
        return Frequency::Weekly;
    };
    let lower = text.to_lowercase();
    if lower.contains("fortnight") || lower.contains("biweek") || lower.contains("every other") {
        Frequency::Biweekly
    } else if lower.contains("month") {
        Frequency::Monthly
    } else if lower.contains("irregular") || lower.contains("occasional") {
        Frequency::Irregular
    } else {
        Frequency::Weekly
    }
}

/// Validate and normalize one raw detail into a `ListingInput`. Missing
/// required fields and unparseable time text are validation errors; the
/// listing is skipped, never retried.
pub fn normalize_detail(source_id: &str, detail: &RawDetail) -> Result<ListingInput> {
    let name = detail.name.trim();
    if name.is_empty() {
        return Err(IngestError::Validation {
            message: format!("listing at {} has no venue name", detail.url),
        });
    }
    let address = detail.address.trim();
    if address.is_empty() {
        return Err(IngestError::Validation {
            message: format!("listing at {} has no address", detail.url),
        });
    }

    let (day_of_week, start_time) = parse_day_and_time(&detail.time_text)?;
    let entry_fee_cents = detail.fee_text.as_deref().and_then(parse_fee_cents);
    let frequency = parse_frequency(detail.frequency_text.as_deref());

    let postcode = detail
        .postcode
        .clone()
        .or_else(|| extract_postcode(address));

    let performer = detail.performer_name.as_ref().map(|name| PerformerInput {
        name: name.trim().to_string(),
        profile_image: detail.performer_image.clone(),
    });

    let mut metadata = json!({ "url": detail.url });
    if let Some(sha) = &detail.payload_sha256 {
        metadata["payload_sha256"] = json!(sha);
    }

    Ok(ListingInput {
        source_id: source_id.to_string(),
        source_url: detail.url.clone(),
        venue: VenueInput {
            name: name.to_string(),
            address: address.to_string(),
            latitude: detail.latitude,
            longitude: detail.longitude,
            place_id: detail.place_id.clone(),
            postcode,
            phone: detail.phone.clone(),
            website: detail.website.clone(),
            city: None,
            country_code: None,
        },
        event: EventInput {
            day_of_week,
            start_time,
            frequency,
            entry_fee_cents,
            description: detail
                .description
                .as_deref()
                .map(str::trim)
                .filter(|d| !d.is_empty())
                .map(str::to_string),
            performer,
            image_url: detail.image_url.clone(),
        },
        metadata,
    })
}

/// Pull a trailing UK-style postcode out of an address line.
pub fn extract_postcode(address: &str) -> Option<String> {
    let re = regex::Regex::new(r"(?i)\b([A-Z]{1,2}\d[A-Z\d]?\s*\d[A-Z]{2})\s*$").ok()?;
    re.captures(address)
        .and_then(|caps| caps.get(1))
        .map(|m| qn_core::normalize::normalize_postcode(m.as_str()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn detail(name: &str, address: &str, time_text: &str) -> RawDetail {
        RawDetail {
            url: "https://quizfeed.example/railway".to_string(),
            name: name.to_string(),
            address: address.to_string(),
            time_text: time_text.to_string(),
            fee_text: None,
            frequency_text: None,
            description: None,
            latitude: None,
            longitude: None,
            postcode: None,
            place_id: None,
            phone: None,
            website: None,
            performer_name: None,
            performer_image: None,
            image_url: None,
            payload_sha256: None,
        }
    }

    #[test]
    fn parses_day_and_time_variants() {
        assert_eq!(
            parse_day_and_time("Wednesday 20:00").unwrap(),
            (3, NaiveTime::from_hms_opt(20, 0, 0).unwrap())
        );
        assert_eq!(
            parse_day_and_time("thu 7:30pm").unwrap(),
            (4, NaiveTime::from_hms_opt(19, 30, 0).unwrap())
        );
        assert_eq!(
            parse_day_and_time("Sun 8pm").unwrap(),
            (7, NaiveTime::from_hms_opt(20, 0, 0).unwrap())
        );
    }

    #[test]
    fn rejects_bad_time_text() {
        assert!(parse_day_and_time("whenever").is_err());
        assert!(parse_day_and_time("Wednesday late").is_err());
        assert!(parse_day_and_time("").is_err());
    }

    #[test]
    fn parses_fee_text() {
        assert_eq!(parse_fee_cents("£2.50"), Some(250));
        assert_eq!(parse_fee_cents("Free entry"), Some(0));
        assert_eq!(parse_fee_cents("£3"), Some(300));
        assert_eq!(parse_fee_cents("ask at the bar"), None);
    }

    #[test]
    fn frequency_defaults_to_weekly() {
        assert_eq!(parse_frequency(None), Frequency::Weekly);
        assert_eq!(parse_frequency(Some("every week")), Frequency::Weekly);
        assert_eq!(parse_frequency(Some("fortnightly")), Frequency::Biweekly);
        assert_eq!(parse_frequency(Some("first Monday of the month")), Frequency::Monthly);
    }

    #[test]
    fn normalizes_end_to_end_example() {
        let mut d = detail("The Railway (Back Room)", "12 High St, SW6 4UL", "Wednesday 20:00");
        d.fee_text = Some("£2.50".to_string());
        let listing = normalize_detail("quizfeed", &d).unwrap();
        assert_eq!(listing.event.day_of_week, 3);
        assert_eq!(listing.event.entry_fee_cents, Some(250));
        assert_eq!(listing.venue.postcode.as_deref(), Some("SW64UL"));
        assert_eq!(listing.venue.name, "The Railway (Back Room)");
    }

    #[test]
    fn missing_name_is_a_validation_error() {
        let d = detail("  ", "12 High St", "Wednesday 20:00");
        let err = normalize_detail("quizfeed", &d).unwrap_err();
        assert!(matches!(err, IngestError::Validation { .. }));
    }
}
