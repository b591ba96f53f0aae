//! HTTP fetch, politeness pacing, checkpoint file, and the relational
//! store behind trait seams.

use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use reel_core::{CatalogRecord, ProfileFilmEntry, ProfileSnapshot};
use serde::{Deserialize, Serialize};
use sqlx::{PgPool, Row};
use thiserror::Error;
use tokio::fs;
use tracing::info_span;

pub const CRATE_NAME: &str = "reel-storage";

pub const FILM_URL_PREFIX: &str = "https://letterboxd.com/film/";

/// Canonical detail-page URL for a film slug; the join key between
/// profile entries and catalog records.
pub fn film_url(slug: &str) -> String {
    format!("{FILM_URL_PREFIX}{slug}/")
}

fn slug_from_url(url: &str) -> Option<String> {
    url.strip_prefix(FILM_URL_PREFIX)
        .map(|rest| rest.trim_end_matches('/').to_string())
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    Status { status: u16, url: String },
}

impl FetchError {
    /// HTTP status when the failure was a non-success response.
    pub fn status(&self) -> Option<u16> {
        match self {
            FetchError::Status { status, .. } => Some(*status),
            FetchError::Request(_) => None,
        }
    }
}

/// Seam between harvesters and the network.
#[async_trait]
pub trait FetchPage: Send + Sync {
    async fn fetch(&self, url: &str) -> Result<String, FetchError>;
}

/// Production fetcher: identifying User-Agent, bounded timeout, no retry.
/// Politeness delay is the caller's obligation, not hidden in here.
#[derive(Debug)]
pub struct PageFetcher {
    client: reqwest::Client,
}

impl PageFetcher {
    pub fn new(user_agent: &str, timeout: Duration) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(timeout)
            .user_agent(user_agent.to_string())
            .build()
            .context("building reqwest client")?;
        Ok(Self { client })
    }
}

#[async_trait]
impl FetchPage for PageFetcher {
    async fn fetch(&self, url: &str) -> Result<String, FetchError> {
        let span = info_span!("http_fetch", url);
        let _guard = span.enter();

        let response = self.client.get(url).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(FetchError::Status {
                status: status.as_u16(),
                url: response.url().to_string(),
            });
        }
        Ok(response.text().await?)
    }
}

/// Inter-request delay: `base + uniform(0, jitter)`.
#[derive(Debug, Clone, Copy)]
pub struct Politeness {
    pub base: Duration,
    pub jitter: Duration,
}

impl Politeness {
    /// Bulk catalog walks: 2s + uniform(0, 2s).
    pub fn catalog() -> Self {
        Self {
            base: Duration::from_secs(2),
            jitter: Duration::from_secs(2),
        }
    }

    /// Profile page walks: a flat 500ms.
    pub fn profile() -> Self {
        Self {
            base: Duration::from_millis(500),
            jitter: Duration::ZERO,
        }
    }

    pub fn delay(&self) -> Duration {
        self.base + self.jitter.mul_f64(rand::random::<f64>())
    }
}

/// Clock seam so tests run without wall-clock delay.
#[async_trait]
pub trait Sleeper: Send + Sync {
    async fn sleep(&self, duration: Duration);
}

#[derive(Debug, Clone, Copy, Default)]
pub struct TokioSleeper;

#[async_trait]
impl Sleeper for TokioSleeper {
    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }
}

/// One failed harvest item. `kind` distinguishes "network flaked" from
/// "site changed shape".
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HarvestError {
    pub index: usize,
    pub link: String,
    pub kind: HarvestErrorKind,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum HarvestErrorKind {
    Fetch {
        status: Option<u16>,
        message: String,
    },
    MissingData,
    Extract {
        message: String,
    },
}

impl fmt::Display for HarvestError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.kind {
            HarvestErrorKind::Fetch {
                status: Some(status),
                ..
            } => write!(f, "[{}] FAILED ({}): {}", self.index, status, self.link),
            HarvestErrorKind::Fetch { message, .. } => {
                write!(f, "[{}] ERROR: {} - {}", self.index, self.link, message)
            }
            HarvestErrorKind::MissingData => write!(f, "[{}] NO DATA: {}", self.index, self.link),
            HarvestErrorKind::Extract { message } => {
                write!(f, "[{}] ERROR: {} - {}", self.index, self.link, message)
            }
        }
    }
}

/// Durable harvesting progress: last fully processed 1-based index plus
/// every error accumulated so far.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct HarvestProgress {
    pub last_index: usize,
    pub errors: Vec<HarvestError>,
}

impl HarvestProgress {
    /// Distinct failed links in first-failure order, for a retry pass.
    pub fn failed_links(&self) -> Vec<String> {
        let mut seen = std::collections::HashSet::new();
        self.errors
            .iter()
            .filter(|e| seen.insert(e.link.clone()))
            .map(|e| e.link.clone())
            .collect()
    }
}

#[derive(Debug, Error)]
pub enum CheckpointError {
    #[error("checkpoint io: {0}")]
    Io(#[from] std::io::Error),
    #[error("checkpoint encoding: {0}")]
    Encoding(#[from] serde_json::Error),
}

/// JSON checkpoint file, written atomically via temp-file rename.
#[derive(Debug, Clone)]
pub struct Checkpoint {
    path: PathBuf,
}

impl Checkpoint {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// `None` when no checkpoint has been written yet.
    pub async fn load(&self) -> Result<Option<HarvestProgress>, CheckpointError> {
        match fs::read_to_string(&self.path).await {
            Ok(text) => Ok(Some(serde_json::from_str(&text)?)),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    pub async fn save(&self, progress: &HarvestProgress) -> Result<(), CheckpointError> {
        let bytes = serde_json::to_vec_pretty(progress)?;
        let temp_path = self.path.with_extension("tmp");
        fs::write(&temp_path, &bytes).await?;
        fs::rename(&temp_path, &self.path).await?;
        Ok(())
    }
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

/// One catalog record matched to a profile slug, rating present.
#[derive(Debug, Clone, PartialEq)]
pub struct CatalogMatch {
    pub slug: String,
    pub title: String,
    pub rating: f64,
}

/// One director credit on a matched film.
#[derive(Debug, Clone, PartialEq)]
pub struct FilmDirector {
    pub slug: String,
    pub name: String,
    pub external_id: String,
}

#[async_trait]
pub trait CatalogWriter: Send + Sync {
    /// Bulk-insert one batch; re-harvested URLs overwrite, never duplicate.
    async fn insert_films(&self, records: &[CatalogRecord]) -> Result<(), StoreError>;
}

#[async_trait]
pub trait ProfileStore: Send + Sync {
    /// Upsert-with-replace of one (username, date) snapshot in a single
    /// transaction: update the total, delete then reinsert the entries.
    async fn replace_snapshot(&self, snapshot: &ProfileSnapshot) -> Result<(), StoreError>;

    async fn latest_snapshot(&self, username: &str)
        -> Result<Option<ProfileSnapshot>, StoreError>;
}

#[async_trait]
pub trait CatalogIndex: Send + Sync {
    /// Catalog records reachable from the given slugs via the canonical
    /// URL key, restricted to records with a rating.
    async fn rated_matches(&self, slugs: &[String]) -> Result<Vec<CatalogMatch>, StoreError>;

    /// Director credits for the given slugs through the associative
    /// director relation.
    async fn directors_for(&self, slugs: &[String]) -> Result<Vec<FilmDirector>, StoreError>;
}

const INSERT_FILM_SQL: &str = "\
    INSERT INTO films \
        (title, year, actors, studios, genres, countries, rating, rating_count, \
         review_count, description, url, image) \
    VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12) \
    ON CONFLICT (url) DO UPDATE SET \
        title = EXCLUDED.title, year = EXCLUDED.year, actors = EXCLUDED.actors, \
        studios = EXCLUDED.studios, genres = EXCLUDED.genres, \
        countries = EXCLUDED.countries, rating = EXCLUDED.rating, \
        rating_count = EXCLUDED.rating_count, review_count = EXCLUDED.review_count, \
        description = EXCLUDED.description, image = EXCLUDED.image";

const UPSERT_DIRECTOR_SQL: &str = "\
    INSERT INTO directors (external_id, name) VALUES ($1, $2) \
    ON CONFLICT (external_id) DO UPDATE SET name = EXCLUDED.name";

const LINK_DIRECTOR_SQL: &str = "\
    INSERT INTO film_directors (film_url, director_external_id) VALUES ($1, $2) \
    ON CONFLICT DO NOTHING";

/// Postgres-backed store. The pool is owned explicitly and injected at
/// construction; acquisition is scoped per call.
#[derive(Debug, Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl CatalogWriter for PgStore {
    async fn insert_films(&self, records: &[CatalogRecord]) -> Result<(), StoreError> {
        if records.is_empty() {
            return Ok(());
        }

        let mut tx = self.pool.begin().await?;
        for record in records {
            sqlx::query(INSERT_FILM_SQL)
                .bind(record.title.as_deref())
                .bind(record.year.as_deref())
                .bind(serde_json::to_value(&record.actors).unwrap_or_default())
                .bind(serde_json::to_value(&record.studios).unwrap_or_default())
                .bind(&record.genres)
                .bind(&record.countries)
                .bind(record.rating)
                .bind(record.rating_count)
                .bind(record.review_count)
                .bind(record.description.as_deref())
                .bind(record.url.as_deref())
                .bind(record.image.as_deref())
                .execute(&mut *tx)
                .await?;

            let Some(url) = record.url.as_deref() else {
                continue;
            };
            for director in &record.directors {
                sqlx::query(UPSERT_DIRECTOR_SQL)
                    .bind(&director.external_id)
                    .bind(&director.name)
                    .execute(&mut *tx)
                    .await?;
                sqlx::query(LINK_DIRECTOR_SQL)
                    .bind(url)
                    .bind(&director.external_id)
                    .execute(&mut *tx)
                    .await?;
            }
        }
        tx.commit().await?;
        Ok(())
    }
}

#[async_trait]
impl ProfileStore for PgStore {
    async fn replace_snapshot(&self, snapshot: &ProfileSnapshot) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;

        let existing = sqlx::query(
            "SELECT id FROM profiles WHERE username = $1 AND scraped_date = $2",
        )
        .bind(&snapshot.username)
        .bind(snapshot.scraped_date)
        .fetch_optional(&mut *tx)
        .await?;

        let profile_id: i64 = match existing {
            Some(row) => {
                let id: i64 = row.try_get("id")?;
                sqlx::query("UPDATE profiles SET total_films = $1 WHERE id = $2")
                    .bind(snapshot.total_films)
                    .bind(id)
                    .execute(&mut *tx)
                    .await?;
                sqlx::query("DELETE FROM profile_films WHERE profile_id = $1")
                    .bind(id)
                    .execute(&mut *tx)
                    .await?;
                id
            }
            None => {
                let row = sqlx::query(
                    "INSERT INTO profiles (username, scraped_date, total_films) \
                     VALUES ($1, $2, $3) RETURNING id",
                )
                .bind(&snapshot.username)
                .bind(snapshot.scraped_date)
                .bind(snapshot.total_films)
                .fetch_one(&mut *tx)
                .await?;
                row.try_get("id")?
            }
        };

        for entry in &snapshot.entries {
            sqlx::query(
                "INSERT INTO profile_films (profile_id, film_slug, rating) VALUES ($1, $2, $3)",
            )
            .bind(profile_id)
            .bind(&entry.film_slug)
            .bind(entry.rating)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    async fn latest_snapshot(
        &self,
        username: &str,
    ) -> Result<Option<ProfileSnapshot>, StoreError> {
        let Some(row) = sqlx::query(
            "SELECT id, username, scraped_date, total_films FROM profiles \
             WHERE username = $1 ORDER BY scraped_date DESC LIMIT 1",
        )
        .bind(username)
        .fetch_optional(&self.pool)
        .await?
        else {
            return Ok(None);
        };

        let profile_id: i64 = row.try_get("id")?;
        let entries = sqlx::query(
            "SELECT film_slug, rating FROM profile_films WHERE profile_id = $1 ORDER BY id",
        )
        .bind(profile_id)
        .fetch_all(&self.pool)
        .await?
        .into_iter()
        .map(|r| {
            Ok(ProfileFilmEntry {
                film_slug: r.try_get("film_slug")?,
                rating: r.try_get("rating")?,
            })
        })
        .collect::<Result<Vec<_>, sqlx::Error>>()?;

        Ok(Some(ProfileSnapshot {
            username: row.try_get("username")?,
            scraped_date: row.try_get("scraped_date")?,
            total_films: row.try_get("total_films")?,
            entries,
        }))
    }
}

#[async_trait]
impl CatalogIndex for PgStore {
    async fn rated_matches(&self, slugs: &[String]) -> Result<Vec<CatalogMatch>, StoreError> {
        let urls: Vec<String> = slugs.iter().map(|s| film_url(s)).collect();
        let rows = sqlx::query(
            "SELECT url, title, rating FROM films \
             WHERE url = ANY($1) AND rating IS NOT NULL",
        )
        .bind(&urls)
        .fetch_all(&self.pool)
        .await?;

        let mut matches = Vec::with_capacity(rows.len());
        for row in rows {
            let url: String = row.try_get("url")?;
            let Some(slug) = slug_from_url(&url) else {
                continue;
            };
            let title: Option<String> = row.try_get("title")?;
            matches.push(CatalogMatch {
                slug,
                title: title.unwrap_or_default(),
                rating: row.try_get("rating")?,
            });
        }
        Ok(matches)
    }

    async fn directors_for(&self, slugs: &[String]) -> Result<Vec<FilmDirector>, StoreError> {
        let urls: Vec<String> = slugs.iter().map(|s| film_url(s)).collect();
        let rows = sqlx::query(
            "SELECT fd.film_url, d.name, d.external_id \
             FROM film_directors fd \
             JOIN directors d ON d.external_id = fd.director_external_id \
             WHERE fd.film_url = ANY($1)",
        )
        .bind(&urls)
        .fetch_all(&self.pool)
        .await?;

        let mut credits = Vec::with_capacity(rows.len());
        for row in rows {
            let url: String = row.try_get("film_url")?;
            let Some(slug) = slug_from_url(&url) else {
                continue;
            };
            credits.push(FilmDirector {
                slug,
                name: row.try_get("name")?,
                external_id: row.try_get("external_id")?,
            });
        }
        Ok(credits)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn film_url_round_trips_through_slug() {
        let url = film_url("fargo");
        assert_eq!(url, "https://letterboxd.com/film/fargo/");
        assert_eq!(slug_from_url(&url).as_deref(), Some("fargo"));
        assert_eq!(slug_from_url("https://example.com/other/"), None);
    }

    #[test]
    fn politeness_delay_stays_within_jitter_window() {
        let pacing = Politeness::catalog();
        for _ in 0..32 {
            let delay = pacing.delay();
            assert!(delay >= Duration::from_secs(2));
            assert!(delay <= Duration::from_secs(4));
        }
        assert_eq!(Politeness::profile().delay(), Duration::from_millis(500));
    }

    #[test]
    fn harvest_error_display_matches_log_shapes() {
        let failed = HarvestError {
            index: 12,
            link: "/film/fargo/".into(),
            kind: HarvestErrorKind::Fetch {
                status: Some(404),
                message: "http status 404".into(),
            },
        };
        assert_eq!(failed.to_string(), "[12] FAILED (404): /film/fargo/");

        let no_data = HarvestError {
            index: 13,
            link: "/film/heat/".into(),
            kind: HarvestErrorKind::MissingData,
        };
        assert_eq!(no_data.to_string(), "[13] NO DATA: /film/heat/");

        let broken = HarvestError {
            index: 14,
            link: "/film/ran/".into(),
            kind: HarvestErrorKind::Extract {
                message: "bad payload".into(),
            },
        };
        assert_eq!(broken.to_string(), "[14] ERROR: /film/ran/ - bad payload");
    }

    #[test]
    fn failed_links_dedupe_in_first_failure_order() {
        let progress = HarvestProgress {
            last_index: 30,
            errors: vec![
                HarvestError {
                    index: 3,
                    link: "/film/a/".into(),
                    kind: HarvestErrorKind::MissingData,
                },
                HarvestError {
                    index: 9,
                    link: "/film/b/".into(),
                    kind: HarvestErrorKind::MissingData,
                },
                HarvestError {
                    index: 21,
                    link: "/film/a/".into(),
                    kind: HarvestErrorKind::Fetch {
                        status: Some(500),
                        message: "http status 500".into(),
                    },
                },
            ],
        };
        assert_eq!(progress.failed_links(), vec!["/film/a/", "/film/b/"]);
    }

    #[tokio::test]
    async fn checkpoint_round_trips_and_reports_missing_file() {
        let dir = tempdir().expect("tempdir");
        let checkpoint = Checkpoint::new(dir.path().join("progress.json"));

        assert_eq!(checkpoint.load().await.expect("load empty"), None);

        let progress = HarvestProgress {
            last_index: 40,
            errors: vec![HarvestError {
                index: 17,
                link: "/film/fargo/".into(),
                kind: HarvestErrorKind::MissingData,
            }],
        };
        checkpoint.save(&progress).await.expect("save");

        let loaded = checkpoint.load().await.expect("load").expect("present");
        assert_eq!(loaded, progress);
    }

    #[tokio::test]
    async fn checkpoint_save_overwrites_previous_state() {
        let dir = tempdir().expect("tempdir");
        let checkpoint = Checkpoint::new(dir.path().join("progress.json"));

        checkpoint
            .save(&HarvestProgress {
                last_index: 10,
                errors: vec![],
            })
            .await
            .expect("first save");
        checkpoint
            .save(&HarvestProgress {
                last_index: 20,
                errors: vec![],
            })
            .await
            .expect("second save");

        let loaded = checkpoint.load().await.expect("load").expect("present");
        assert_eq!(loaded.last_index, 20);
    }
}
