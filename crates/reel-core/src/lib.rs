//! Core domain model for Reel Signal.

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

pub const CRATE_NAME: &str = "reel-core";

/// One credited person or company on a film, with the external site's
/// identifier (the second-to-last path segment of its canonical URL).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreditEntry {
    pub name: String,
    pub external_id: String,
}

/// One harvested film detail page. Every field except the credit and
/// genre/country collections may be absent from the source document.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct CatalogRecord {
    pub title: Option<String>,
    /// Release year as the source yields it; not guaranteed numeric.
    pub year: Option<String>,
    pub directors: Vec<CreditEntry>,
    pub actors: Vec<CreditEntry>,
    pub studios: Vec<CreditEntry>,
    pub genres: Vec<String>,
    pub countries: Vec<String>,
    pub rating: Option<f64>,
    pub rating_count: Option<i64>,
    pub review_count: Option<i64>,
    pub description: Option<String>,
    /// Canonical URL; the unique key at the store layer.
    pub url: Option<String>,
    pub image: Option<String>,
}

/// One watched-film entry on a profile page. A missing rating means the
/// user logged the film without rating it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProfileFilmEntry {
    pub film_slug: String,
    pub rating: Option<f64>,
}

/// One dated capture of a user's rated-films profile.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProfileSnapshot {
    pub username: String,
    pub scraped_date: NaiveDate,
    pub total_films: Option<i64>,
    pub entries: Vec<ProfileFilmEntry>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Higher,
    Lower,
    Same,
}

impl Direction {
    pub fn from_diff(diff: f64) -> Self {
        if diff > 0.0 {
            Direction::Higher
        } else if diff < 0.0 {
            Direction::Lower
        } else {
            Direction::Same
        }
    }
}

/// One matched film in a reconciliation report: the user's rating against
/// the catalog aggregate, with the signed delta.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReconciliationRow {
    pub slug: String,
    pub title: String,
    pub user_rating: f64,
    /// Catalog aggregate rounded to one decimal before diffing.
    pub catalog_rating: f64,
    pub diff: f64,
    pub direction: Direction,
}

/// Per-director rollup over the matched rows.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DirectorAggregate {
    pub name: String,
    pub external_id: String,
    pub film_count: usize,
    pub avg_diff: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReconcileReport {
    pub username: String,
    pub scraped_date: NaiveDate,
    pub total_films: Option<i64>,
    pub matched: usize,
    pub rows: Vec<ReconciliationRow>,
    pub directors: Vec<DirectorAggregate>,
}

pub fn round1(value: f64) -> f64 {
    (value * 10.0).round() / 10.0
}

pub fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}
