//! Pure document extractors: film detail pages, profile film grids, and
//! list pages. Text in, typed record out; no I/O.

use reel_core::{CatalogRecord, CreditEntry, ProfileFilmEntry};
use scraper::{Html, Selector};
use serde_json::Value as JsonValue;
use thiserror::Error;

pub const CRATE_NAME: &str = "reel-extract";

const CDATA_PREFIX: &str = "/* <![CDATA[ */";
const CDATA_SUFFIX: &str = "/* ]]> */";

#[derive(Debug, Error)]
pub enum ExtractError {
    /// The embedded structured-data block is absent. Logged as "NO DATA"
    /// by callers, distinct from transport failures.
    #[error("structured data block not found in document")]
    MissingStructuredData,
    #[error("invalid structured data payload: {0}")]
    InvalidStructuredData(#[from] serde_json::Error),
    #[error("invalid selector {0}")]
    Selector(String),
}

/// One parsed profile film-grid page. `total_films` only appears in the
/// page header, so it is only meaningful when parsing page 1.
#[derive(Debug, Clone, PartialEq)]
pub struct ProfilePage {
    pub total_films: Option<i64>,
    pub entries: Vec<ProfileFilmEntry>,
}

/// Maps the ten discrete rating class tokens to the half-star scale.
pub fn rating_for_class(class: &str) -> Option<f64> {
    match class {
        "rated-1" => Some(0.5),
        "rated-2" => Some(1.0),
        "rated-3" => Some(1.5),
        "rated-4" => Some(2.0),
        "rated-5" => Some(2.5),
        "rated-6" => Some(3.0),
        "rated-7" => Some(3.5),
        "rated-8" => Some(4.0),
        "rated-9" => Some(4.5),
        "rated-10" => Some(5.0),
        _ => None,
    }
}

fn parse_selector(selector: &str) -> Result<Selector, ExtractError> {
    Selector::parse(selector).map_err(|_| ExtractError::Selector(selector.to_string()))
}

fn text_or_none(value: String) -> Option<String> {
    let trimmed = value.trim().to_string();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed)
    }
}

fn select_first_text(document: &Html, selector: &str) -> Result<Option<String>, ExtractError> {
    let sel = parse_selector(selector)?;
    Ok(document
        .select(&sel)
        .next()
        .and_then(|n| text_or_none(n.text().collect::<String>())))
}

fn json_str<'a>(value: &'a JsonValue, path: &[&str]) -> Option<&'a str> {
    let mut cur = value;
    for segment in path {
        cur = cur.get(*segment)?;
    }
    cur.as_str()
}

fn json_f64(value: &JsonValue, path: &[&str]) -> Option<f64> {
    let mut cur = value;
    for segment in path {
        cur = cur.get(*segment)?;
    }
    cur.as_f64()
}

fn json_i64(value: &JsonValue, path: &[&str]) -> Option<i64> {
    let mut cur = value;
    for segment in path {
        cur = cur.get(*segment)?;
    }
    cur.as_i64()
}

/// The source sometimes emits the release date as a bare number.
fn json_stringified(value: &JsonValue) -> Option<String> {
    match value {
        JsonValue::String(s) => text_or_none(s.clone()),
        JsonValue::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// Second-to-last path segment of an entity's canonical URL, e.g.
/// `https://letterboxd.com/director/joel-coen/` -> `joel-coen`.
fn penultimate_segment(url: &str) -> Option<String> {
    let parts: Vec<&str> = url.split('/').collect();
    if parts.len() < 2 {
        return None;
    }
    let segment = parts[parts.len() - 2];
    if segment.is_empty() {
        None
    } else {
        Some(segment.to_string())
    }
}

fn credit_entries(value: &JsonValue, key: &str) -> Vec<CreditEntry> {
    let Some(items) = value.get(key).and_then(|v| v.as_array()) else {
        return Vec::new();
    };
    items
        .iter()
        .filter_map(|item| {
            let name = json_str(item, &["name"])?.to_string();
            let external_id = json_str(item, &["sameAs"]).and_then(penultimate_segment)?;
            Some(CreditEntry { name, external_id })
        })
        .collect()
}

fn string_array(value: &JsonValue, key: &str) -> Vec<String> {
    value
        .get(key)
        .and_then(|v| v.as_array())
        .map(|items| {
            items
                .iter()
                .filter_map(|v| v.as_str().map(ToString::to_string))
                .collect()
        })
        .unwrap_or_default()
}

fn name_array(value: &JsonValue, key: &str) -> Vec<String> {
    value
        .get(key)
        .and_then(|v| v.as_array())
        .map(|items| {
            items
                .iter()
                .filter_map(|v| json_str(v, &["name"]).map(ToString::to_string))
                .collect()
        })
        .unwrap_or_default()
}

fn structured_data_payload(document: &Html) -> Result<JsonValue, ExtractError> {
    let sel = parse_selector(r#"script[type="application/ld+json"]"#)?;
    let raw = document
        .select(&sel)
        .next()
        .map(|n| n.text().collect::<String>())
        .ok_or(ExtractError::MissingStructuredData)?;
    let trimmed = raw.trim();
    let trimmed = trimmed.strip_prefix(CDATA_PREFIX).unwrap_or(trimmed);
    let trimmed = trimmed.strip_suffix(CDATA_SUFFIX).unwrap_or(trimmed);
    Ok(serde_json::from_str(trimmed.trim())?)
}

/// Catalog mode: parse one film detail page into a [`CatalogRecord`].
///
/// Optional fields tolerate absence; the whole record fails only when the
/// structured-data block itself is missing or unparseable.
pub fn extract_film(html: &str) -> Result<CatalogRecord, ExtractError> {
    let document = Html::parse_document(html);
    let data = structured_data_payload(&document)?;

    let year = data
        .get("releasedEvent")
        .and_then(|v| v.as_array())
        .and_then(|events| events.first())
        .and_then(|event| event.get("startDate"))
        .and_then(json_stringified);

    let description = select_first_text(&document, "div.truncate p")?;

    Ok(CatalogRecord {
        title: json_str(&data, &["name"]).map(ToString::to_string),
        year,
        directors: credit_entries(&data, "director"),
        actors: credit_entries(&data, "actors"),
        studios: credit_entries(&data, "productionCompany"),
        genres: string_array(&data, "genre"),
        countries: name_array(&data, "countryOfOrigin"),
        rating: json_f64(&data, &["aggregateRating", "ratingValue"]),
        rating_count: json_i64(&data, &["aggregateRating", "ratingCount"]),
        review_count: json_i64(&data, &["aggregateRating", "reviewCount"]),
        description,
        url: json_str(&data, &["url"]).map(ToString::to_string),
        image: json_str(&data, &["image"]).map(ToString::to_string),
    })
}

/// Profile-page mode: parse one film-grid page of a user profile.
///
/// Items lacking a slug attribute are skipped; a grid item without any
/// rating token yields a `None` rating, never zero.
pub fn extract_profile_page(html: &str) -> Result<ProfilePage, ExtractError> {
    let document = Html::parse_document(html);

    let total_films = select_first_text(&document, r#"a[href$="/films/"] span.value"#)?
        .and_then(|text| text.replace(',', "").parse::<i64>().ok());

    let item_sel = parse_selector("li.griditem")?;
    let rating_sel = parse_selector("span.rating")?;
    let slug_sel = parse_selector("[data-item-slug]")?;

    let mut entries = Vec::new();
    for item in document.select(&item_sel) {
        let Some(film_slug) = item
            .select(&slug_sel)
            .next()
            .and_then(|n| n.value().attr("data-item-slug"))
            .map(ToString::to_string)
        else {
            continue;
        };

        let rating = item
            .select(&rating_sel)
            .next()
            .and_then(|span| span.value().classes().find_map(rating_for_class));

        entries.push(ProfileFilmEntry { film_slug, rating });
    }

    Ok(ProfilePage {
        total_films,
        entries,
    })
}

/// List mode: relative detail-page links from one page of a public list.
pub fn extract_list_links(html: &str) -> Result<Vec<String>, ExtractError> {
    let document = Html::parse_document(html);
    let sel = parse_selector("div.react-component")?;
    Ok(document
        .select(&sel)
        .filter_map(|n| n.value().attr("data-item-link"))
        .map(ToString::to_string)
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    const FILM_PAGE: &str = r#"<html><head>
<script type="application/ld+json">
/* <![CDATA[ */
{
  "name": "Fargo",
  "url": "https://letterboxd.com/film/fargo/",
  "image": "https://a.ltrbxd.com/resized/fargo.jpg",
  "releasedEvent": [{"startDate": "1996"}],
  "director": [{"name": "Joel Coen", "sameAs": "https://letterboxd.com/director/joel-coen/"}],
  "actors": [
    {"name": "Frances McDormand", "sameAs": "https://letterboxd.com/actor/frances-mcdormand/"},
    {"name": "No Identifier Here"}
  ],
  "productionCompany": [{"name": "PolyGram", "sameAs": "https://letterboxd.com/studio/polygram/"}],
  "genre": ["Crime", "Drama"],
  "countryOfOrigin": [{"name": "USA"}, {"name": "UK"}],
  "aggregateRating": {"ratingValue": 4.12, "ratingCount": 500000, "reviewCount": 12000}
}
/* ]]> */
</script>
</head><body>
<div class="truncate"><p>  A car salesman hires two criminals.  </p></div>
</body></html>"#;

    #[test]
    fn film_page_maps_structured_data() {
        let record = extract_film(FILM_PAGE).unwrap();
        assert_eq!(record.title.as_deref(), Some("Fargo"));
        assert_eq!(record.year.as_deref(), Some("1996"));
        assert_eq!(record.directors.len(), 1);
        assert_eq!(record.directors[0].name, "Joel Coen");
        assert_eq!(record.directors[0].external_id, "joel-coen");
        // entity without a canonical identifier is skipped
        assert_eq!(record.actors.len(), 1);
        assert_eq!(record.actors[0].external_id, "frances-mcdormand");
        assert_eq!(record.studios[0].external_id, "polygram");
        assert_eq!(record.genres, vec!["Crime", "Drama"]);
        assert_eq!(record.countries, vec!["USA", "UK"]);
        assert_eq!(record.rating, Some(4.12));
        assert_eq!(record.rating_count, Some(500000));
        assert_eq!(record.review_count, Some(12000));
        assert_eq!(
            record.description.as_deref(),
            Some("A car salesman hires two criminals.")
        );
        assert_eq!(record.url.as_deref(), Some("https://letterboxd.com/film/fargo/"));
        assert!(record.image.is_some());
    }

    #[test]
    fn numeric_release_date_is_stringified() {
        let html = r#"<script type="application/ld+json">
            {"name": "X", "releasedEvent": [{"startDate": 1996}]}
        </script>"#;
        let record = extract_film(html).unwrap();
        assert_eq!(record.year.as_deref(), Some("1996"));
    }

    #[test]
    fn missing_structured_data_is_a_distinct_error() {
        let err = extract_film("<html><body><p>nothing here</p></body></html>").unwrap_err();
        assert!(matches!(err, ExtractError::MissingStructuredData));
    }

    #[test]
    fn missing_optional_fields_do_not_fail_the_record() {
        let html = r#"<script type="application/ld+json">{"name": "Sparse"}</script>"#;
        let record = extract_film(html).unwrap();
        assert_eq!(record.title.as_deref(), Some("Sparse"));
        assert!(record.year.is_none());
        assert!(record.directors.is_empty());
        assert!(record.rating.is_none());
        assert!(record.description.is_none());
    }

    const PROFILE_PAGE: &str = r#"<html><body>
<a href="/ck238/films/"><span class="value">1,234</span></a>
<ul>
  <li class="griditem">
    <div data-item-slug="fargo"></div>
    <span class="rating rated-7"></span>
  </li>
  <li class="griditem">
    <div data-item-slug="heat"></div>
    <span class="rating"></span>
  </li>
  <li class="griditem">
    <span class="rating rated-10"></span>
  </li>
</ul>
</body></html>"#;

    #[test]
    fn profile_page_extracts_total_and_entries() {
        let page = extract_profile_page(PROFILE_PAGE).unwrap();
        assert_eq!(page.total_films, Some(1234));
        // item without a slug is skipped, even though it carries a rating
        assert_eq!(page.entries.len(), 2);
        assert_eq!(page.entries[0].film_slug, "fargo");
        assert_eq!(page.entries[0].rating, Some(3.5));
        assert_eq!(page.entries[1].film_slug, "heat");
        assert_eq!(page.entries[1].rating, None);
    }

    #[test]
    fn rating_tokens_map_to_half_star_scale() {
        assert_eq!(rating_for_class("rated-1"), Some(0.5));
        assert_eq!(rating_for_class("rated-7"), Some(3.5));
        assert_eq!(rating_for_class("rated-10"), Some(5.0));
        assert_eq!(rating_for_class("rated-11"), None);
        assert_eq!(rating_for_class("poster"), None);
    }

    #[test]
    fn page_without_header_count_yields_none() {
        let page = extract_profile_page("<html><body><ul></ul></body></html>").unwrap();
        assert_eq!(page.total_films, None);
        assert!(page.entries.is_empty());
    }

    #[test]
    fn list_page_links_come_from_data_attributes() {
        let html = r#"<div class="react-component" data-item-link="/film/fargo/"></div>
            <div class="react-component"></div>
            <div class="react-component" data-item-link="/film/heat/"></div>"#;
        let links = extract_list_links(html).unwrap();
        assert_eq!(links, vec!["/film/fargo/", "/film/heat/"]);
    }
}
