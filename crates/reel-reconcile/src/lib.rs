//! Reconciliation engine: join a user's latest profile snapshot against
//! the harvested catalog and aggregate the rating deltas.

use std::cmp::Ordering;
use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{Context, Result};
use reel_core::{
    round1, round2, Direction, DirectorAggregate, ReconcileReport, ReconciliationRow,
};
use reel_storage::{CatalogIndex, CatalogMatch, ProfileStore};
use tracing::debug;

pub const CRATE_NAME: &str = "reel-reconcile";

pub struct Reconciler {
    profiles: Arc<dyn ProfileStore>,
    catalog: Arc<dyn CatalogIndex>,
}

struct DirectorAcc {
    name: String,
    film_count: usize,
    diff_sum: f64,
}

impl Reconciler {
    pub fn new(profiles: Arc<dyn ProfileStore>, catalog: Arc<dyn CatalogIndex>) -> Self {
        Self { profiles, catalog }
    }

    /// `Ok(None)` means no snapshot exists for the username; an empty
    /// report (zero matches) is a different, valid outcome.
    pub async fn reconcile(&self, username: &str) -> Result<Option<ReconcileReport>> {
        let Some(snapshot) = self
            .profiles
            .latest_snapshot(username)
            .await
            .context("loading latest profile snapshot")?
        else {
            return Ok(None);
        };

        let rated_slugs: Vec<String> = snapshot
            .entries
            .iter()
            .filter(|e| e.rating.is_some())
            .map(|e| e.film_slug.clone())
            .collect();

        let matches = self
            .catalog
            .rated_matches(&rated_slugs)
            .await
            .context("matching snapshot against catalog")?;
        let by_slug: HashMap<&str, &CatalogMatch> =
            matches.iter().map(|m| (m.slug.as_str(), m)).collect();

        // Join in snapshot entry order; only entries where both ratings
        // are present and the slug resolves survive.
        let mut rows = Vec::new();
        for entry in &snapshot.entries {
            let Some(user_rating) = entry.rating else {
                continue;
            };
            let Some(matched) = by_slug.get(entry.film_slug.as_str()) else {
                continue;
            };
            let catalog_rating = round1(matched.rating);
            let diff = round2(user_rating - catalog_rating);
            rows.push(ReconciliationRow {
                slug: entry.film_slug.clone(),
                title: matched.title.clone(),
                user_rating,
                catalog_rating,
                diff,
                direction: Direction::from_diff(diff),
            });
        }

        // Largest divergence first; the sort is stable so ties keep the
        // original join order.
        rows.sort_by(|a, b| {
            b.diff
                .abs()
                .partial_cmp(&a.diff.abs())
                .unwrap_or(Ordering::Equal)
        });

        let directors = self.aggregate_directors(&rows).await?;
        debug!(
            username,
            matched = rows.len(),
            directors = directors.len(),
            "reconciliation complete"
        );

        Ok(Some(ReconcileReport {
            username: snapshot.username,
            scraped_date: snapshot.scraped_date,
            total_films: snapshot.total_films,
            matched: rows.len(),
            rows,
            directors,
        }))
    }

    async fn aggregate_directors(
        &self,
        rows: &[ReconciliationRow],
    ) -> Result<Vec<DirectorAggregate>> {
        if rows.is_empty() {
            return Ok(Vec::new());
        }

        let matched_slugs: Vec<String> = rows.iter().map(|r| r.slug.clone()).collect();
        let diff_by_slug: HashMap<&str, f64> =
            rows.iter().map(|r| (r.slug.as_str(), r.diff)).collect();

        let credits = self
            .catalog
            .directors_for(&matched_slugs)
            .await
            .context("loading director credits")?;

        let mut order: Vec<String> = Vec::new();
        let mut accumulated: HashMap<String, DirectorAcc> = HashMap::new();
        for credit in credits {
            let Some(diff) = diff_by_slug.get(credit.slug.as_str()) else {
                continue;
            };
            let acc = accumulated
                .entry(credit.external_id.clone())
                .or_insert_with(|| {
                    order.push(credit.external_id.clone());
                    DirectorAcc {
                        name: credit.name.clone(),
                        film_count: 0,
                        diff_sum: 0.0,
                    }
                });
            acc.film_count += 1;
            acc.diff_sum += diff;
        }

        let mut aggregates: Vec<DirectorAggregate> = order
            .into_iter()
            .filter_map(|external_id| {
                let acc = accumulated.remove(&external_id)?;
                Some(DirectorAggregate {
                    name: acc.name,
                    external_id,
                    film_count: acc.film_count,
                    avg_diff: round2(acc.diff_sum / acc.film_count as f64),
                })
            })
            .collect();

        // Deterministic output order: most matched films first, name as
        // tie-break.
        aggregates.sort_by(|a, b| {
            b.film_count
                .cmp(&a.film_count)
                .then_with(|| a.name.cmp(&b.name))
        });
        Ok(aggregates)
    }
}
