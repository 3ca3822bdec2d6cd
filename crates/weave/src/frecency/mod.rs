//! Frecency ranking of browsing history
//!
//! Frecency combines how often and how recently a site was visited. Local
//! and remote visits are scored separately and added:
//!
//! ```text
//! local  = (2 + localCount)^2 * max(2, 100 * 225 / (ageDaysLocal^2 + 225))
//! remote = remoteCount        * max(1, 100 * 110 / (ageDaysRemote^2 + 110))
//! ```
//!
//! Ages are measured from the most recent local (resp. remote) visit. Sites
//! not visited at all, or not visited in the last 182 days, are excluded.
//!
//! Everything here is a pure function of its inputs and an explicit `now`.

pub mod query;

use std::cmp::Ordering;
use std::collections::HashMap;

use crate::models::{Guid, MicrosecondTimestamp, Site};

pub use query::SearchQuery;

/// Microseconds per day
pub const MICROS_PER_DAY: f64 = 86_400_000_000.0;

/// 182 days in microseconds
pub const SIX_MONTHS_MICROS: u64 = 15_724_800_000_000;

/// Candidates considered before grouping and limiting
pub const MAX_CANDIDATES: usize = 1000;

/// Default number of top sites kept
pub const TOP_SITES_CACHE_SIZE: usize = 16;

/// Domains never shown as top sites
const EXCLUDED_TOP_SITE_DOMAINS: &[&str] = &["r.", "google."];

/// Aggregated visit statistics for one history entry
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SiteStats {
    pub history_id: i64,
    pub url: String,
    pub title: String,
    pub guid: Option<Guid>,
    pub domain_id: Option<i64>,
    pub domain: Option<String>,
    /// Most recent local visit, 0 if none
    pub local_visit_date: MicrosecondTimestamp,
    /// Most recent remote visit, 0 if none
    pub remote_visit_date: MicrosecondTimestamp,
    pub local_visit_count: u64,
    pub remote_visit_count: u64,
    pub show_on_top_sites: bool,
    pub is_bookmarked: bool,
}

impl SiteStats {
    pub fn frecency(&self, now: MicrosecondTimestamp) -> f64 {
        local_score(self.local_visit_count, self.local_visit_date, now)
            + remote_score(self.remote_visit_count, self.remote_visit_date, now)
    }

    /// Visited at all, and at least once in the last 182 days
    pub fn is_eligible(&self, now: MicrosecondTimestamp) -> bool {
        let cutoff = now.saturating_sub(SIX_MONTHS_MICROS);
        (self.local_visit_count > 0 || self.remote_visit_count > 0)
            && (self.local_visit_date > cutoff || self.remote_visit_date > cutoff)
    }

    fn to_site(&self) -> Site {
        Site {
            id: Some(self.history_id),
            url: self.url.clone(),
            title: self.title.clone(),
            guid: self.guid.clone(),
        }
    }

    fn is_top_site_candidate(&self) -> bool {
        if !self.show_on_top_sites || !self.url.starts_with("http") {
            return false;
        }
        match &self.domain {
            Some(domain) => !EXCLUDED_TOP_SITE_DOMAINS.iter().any(|p| domain.starts_with(p)),
            None => false,
        }
    }
}

/// A ranked result
#[derive(Debug, Clone, PartialEq)]
pub struct RankedSite {
    pub site: Site,
    /// For top sites, the sum over the whole domain
    pub frecency: f64,
    pub is_bookmarked: bool,
}

/// Fractional days between `date` and `now`
pub fn age_days(date: MicrosecondTimestamp, now: MicrosecondTimestamp) -> f64 {
    (now as f64 - date as f64) / MICROS_PER_DAY
}

pub fn local_score(count: u64, last_visit: MicrosecondTimestamp, now: MicrosecondTimestamp) -> f64 {
    let age = age_days(last_visit, now);
    let weight = (2 + count) as f64;
    weight * weight * f64::max(2.0, 100.0 * 225.0 / (age * age + 225.0))
}

pub fn remote_score(count: u64, last_visit: MicrosecondTimestamp, now: MicrosecondTimestamp) -> f64 {
    let age = age_days(last_visit, now);
    count as f64 * f64::max(1.0, 100.0 * 110.0 / (age * age + 110.0))
}

fn by_frecency_desc(a: f64, b: f64) -> Ordering {
    b.partial_cmp(&a).unwrap_or(Ordering::Equal)
}

/// Bookmarked first, then by frecency
fn final_order(ranked: &mut [RankedSite]) {
    ranked.sort_by(|a, b| {
        b.is_bookmarked
            .cmp(&a.is_bookmarked)
            .then_with(|| by_frecency_desc(a.frecency, b.frecency))
    });
}

/// Eligible candidates with their scores, best first, capped at [`MAX_CANDIDATES`]
fn candidates<'a>(
    stats: impl IntoIterator<Item = &'a SiteStats>,
    now: MicrosecondTimestamp,
) -> Vec<(&'a SiteStats, f64)> {
    let mut scored: Vec<_> = stats
        .into_iter()
        .filter(|s| s.is_eligible(now))
        .map(|s| (s, s.frecency(now)))
        .collect();
    scored.sort_by(|a, b| by_frecency_desc(a.1, b.1));
    scored.truncate(MAX_CANDIDATES);
    scored
}

/// Rank individual URLs, e.g. for address bar completion
pub fn rank_sites(stats: &[SiteStats], now: MicrosecondTimestamp, limit: usize) -> Vec<RankedSite> {
    let mut ranked: Vec<RankedSite> = candidates(stats, now)
        .into_iter()
        .take(limit)
        .map(|(s, frecency)| RankedSite {
            site: s.to_site(),
            frecency,
            is_bookmarked: s.is_bookmarked,
        })
        .collect();
    final_order(&mut ranked);
    ranked
}

/// Rank domains for the top sites view
///
/// Each domain is represented by its highest scoring URL and scored by the
/// sum over all of its URLs.
pub fn rank_top_sites(stats: &[SiteStats], now: MicrosecondTimestamp, limit: usize) -> Vec<RankedSite> {
    struct Group<'a> {
        best: &'a SiteStats,
        best_score: f64,
        total: f64,
        is_bookmarked: bool,
    }

    let mut order: Vec<String> = Vec::new();
    let mut groups: HashMap<String, Group<'_>> = HashMap::new();

    for (s, score) in candidates(stats.iter().filter(|s| s.is_top_site_candidate()), now) {
        let Some(domain) = s.domain.clone() else {
            continue;
        };
        match groups.get_mut(&domain) {
            Some(group) => {
                group.total += score;
                group.is_bookmarked |= s.is_bookmarked;
                if score > group.best_score {
                    group.best = s;
                    group.best_score = score;
                }
            }
            None => {
                order.push(domain.clone());
                groups.insert(
                    domain,
                    Group {
                        best: s,
                        best_score: score,
                        total: score,
                        is_bookmarked: s.is_bookmarked,
                    },
                );
            }
        }
    }

    let mut ranked: Vec<RankedSite> = order
        .iter()
        .filter_map(|d| groups.get(d))
        .map(|g| RankedSite {
            site: g.best.to_site(),
            frecency: g.total,
            is_bookmarked: g.is_bookmarked,
        })
        .collect();

    ranked.sort_by(|a, b| by_frecency_desc(a.frecency, b.frecency));
    ranked.truncate(limit);
    final_order(&mut ranked);
    ranked
}

#[cfg(test)]
mod tests {
    use super::*;

    const DAY: u64 = 86_400_000_000;
    const NOW: u64 = 1_700_000_000_000_000;

    fn stats(id: i64, url: &str, domain: &str, local: u64, last_local_age_days: u64) -> SiteStats {
        SiteStats {
            history_id: id,
            url: url.to_string(),
            title: url.to_string(),
            domain_id: Some(id),
            domain: Some(domain.to_string()),
            local_visit_date: if local > 0 { NOW - last_local_age_days * DAY } else { 0 },
            local_visit_count: local,
            show_on_top_sites: true,
            ..Default::default()
        }
    }

    #[test]
    fn test_decay_is_monotonic() {
        let mut previous = f64::INFINITY;
        for age in [0, 1, 2, 5, 10, 30, 90, 181] {
            let score = local_score(3, NOW - age * DAY, NOW);
            assert!(score <= previous, "age {} scored {} > {}", age, score, previous);
            previous = score;

            let remote = remote_score(3, NOW - age * DAY, NOW);
            assert!(remote >= 3.0);
        }
    }

    #[test]
    fn test_three_visits_scenario() {
        // Visits at ages 0, 1 and 10 days: the most recent one is the reference.
        let site = stats(1, "https://example.com", "example.com", 3, 0);
        assert!((site.frecency(NOW) - 2500.0).abs() < 1e-9);

        // Using the oldest visit instead gives the worst case.
        let worst = local_score(3, NOW - 10 * DAY, NOW);
        assert!((worst - 25.0 * 22500.0 / 325.0).abs() < 1e-9);
        assert!((worst - 1730.77).abs() < 0.01);
    }

    #[test]
    fn test_score_floors() {
        // Long-unvisited sites keep the floor weight
        assert_eq!(local_score(0, 0, NOW), 8.0);
        assert_eq!(remote_score(0, 0, NOW), 0.0);
        assert_eq!(remote_score(2, 0, NOW), 2.0);
    }

    #[test]
    fn test_unvisited_sites_excluded() {
        let unvisited = stats(1, "https://a.example/", "a.example", 0, 0);
        let visited = stats(2, "https://b.example/", "b.example", 1, 3);

        let ranked = rank_sites(&[unvisited, visited], NOW, 10);
        assert_eq!(ranked.len(), 1);
        assert_eq!(ranked[0].site.url, "https://b.example/");
    }

    #[test]
    fn test_old_sites_excluded() {
        let old = stats(1, "https://old.example/", "old.example", 500, 183);
        let mut remote_recent = stats(2, "https://r.example/", "re.example", 1, 200);
        remote_recent.remote_visit_count = 1;
        remote_recent.remote_visit_date = NOW - DAY;

        let ranked = rank_sites(&[old.clone(), remote_recent], NOW, 10);
        assert_eq!(ranked.len(), 1);
        assert_eq!(ranked[0].site.id, Some(2));

        assert!(rank_top_sites(&[old], NOW, 10).is_empty());
    }

    #[test]
    fn test_rank_sites_orders_and_limits() {
        let all = vec![
            stats(1, "https://a.example/", "a.example", 1, 20),
            stats(2, "https://b.example/", "b.example", 10, 1),
            stats(3, "https://c.example/", "c.example", 5, 1),
        ];

        let ranked = rank_sites(&all, NOW, 2);
        let ids: Vec<_> = ranked.iter().map(|r| r.site.id.unwrap()).collect();
        assert_eq!(ids, vec![2, 3]);
    }

    #[test]
    fn test_top_sites_group_by_domain() {
        let mut all = vec![
            stats(1, "https://news.example/a", "news.example", 3, 1),
            stats(2, "https://news.example/b", "news.example", 6, 1),
            stats(3, "https://blog.example/", "blog.example", 7, 1),
        ];
        all[0].domain_id = Some(10);
        all[1].domain_id = Some(10);

        let ranked = rank_top_sites(&all, NOW, 16);
        assert_eq!(ranked.len(), 2);
        assert_eq!(ranked[0].site.url, "https://news.example/b");
        let expected = all[0].frecency(NOW) + all[1].frecency(NOW);
        assert!((ranked[0].frecency - expected).abs() < 1e-9);
        assert_eq!(ranked[1].site.url, "https://blog.example/");
    }

    #[test]
    fn test_top_sites_filters() {
        let mut hidden = stats(1, "https://hidden.example/", "hidden.example", 9, 1);
        hidden.show_on_top_sites = false;
        let redirect = stats(2, "https://r.example/", "r.example", 9, 1);
        let google = stats(3, "https://google.com/", "google.com", 9, 1);
        let ftp = stats(4, "ftp://files.example/", "files.example", 9, 1);
        let kept = stats(5, "https://kept.example/", "kept.example", 1, 1);

        let ranked = rank_top_sites(&[hidden, redirect, google, ftp, kept], NOW, 16);
        assert_eq!(ranked.len(), 1);
        assert_eq!(ranked[0].site.id, Some(5));
    }

    #[test]
    fn test_bookmarked_sites_first() {
        let popular = stats(1, "https://popular.example/", "popular.example", 20, 0);
        let mut bookmarked = stats(2, "https://saved.example/", "saved.example", 1, 30);
        bookmarked.is_bookmarked = true;

        let ranked = rank_top_sites(&[popular, bookmarked], NOW, 16);
        assert_eq!(ranked[0].site.id, Some(2));
        assert_eq!(ranked[1].site.id, Some(1));
    }

    #[test]
    fn test_top_sites_limit() {
        let all: Vec<_> = (0..30)
            .map(|i| stats(i, &format!("https://s{}.example/", i), &format!("s{}.example", i), 1 + i as u64, 1))
            .collect();
        let ranked = rank_top_sites(&all, NOW, TOP_SITES_CACHE_SIZE);
        assert_eq!(ranked.len(), 16);
        assert_eq!(ranked[0].site.id, Some(29));
    }
}
