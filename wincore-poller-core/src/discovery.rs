//! Finds the newest published build of a target by probing the repository.
//!
//! Build numbers within a date are neither contiguous nor densely packed, so every
//! candidate number is probed in turn. A streak of misses ends the scan early, and
//! a hard upper bound caps a single scan.

use chrono::NaiveDate;
use tracing::{debug, info};

use crate::contract::ArtifactRepository;
use crate::error::RepositoryError;
use crate::model::{BuildId, PollingTarget};
use crate::repository::ArtifactLocator;

pub const MAX_CONSECUTIVE_MISSES: u32 = 10;
pub const MAX_BUILD_NUMBER: u32 = 1000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DiscoveryLimits {
    pub max_consecutive_misses: u32,
    pub max_build_number: u32,
}

impl Default for DiscoveryLimits {
    fn default() -> Self {
        Self {
            max_consecutive_misses: MAX_CONSECUTIVE_MISSES,
            max_build_number: MAX_BUILD_NUMBER,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Discovery {
    /// Highest build whose probe succeeded, if any.
    pub best: Option<BuildId>,
    pub probes: u32,
}

pub struct BuildDiscoverer<'a> {
    repository: &'a dyn ArtifactRepository,
    locator: &'a ArtifactLocator,
    limits: DiscoveryLimits,
}

impl<'a> BuildDiscoverer<'a> {
    pub fn new(
        repository: &'a dyn ArtifactRepository,
        locator: &'a ArtifactLocator,
        limits: DiscoveryLimits,
    ) -> Self {
        Self {
            repository,
            locator,
            limits,
        }
    }

    /// Scan for builds beyond `current`.
    ///
    /// With nothing tracked the scan starts at `today`, build 1. Otherwise it
    /// continues on the tracked date after the tracked number and, when the tracked
    /// date lies in the past, scans `today` from build 1 as well.
    pub async fn discover(
        &self,
        target: &PollingTarget,
        current: Option<BuildId>,
        today: NaiveDate,
    ) -> Result<Discovery, RepositoryError> {
        let mut total = Discovery {
            best: None,
            probes: 0,
        };

        let scans: Vec<(NaiveDate, u32)> = match current {
            None => vec![(today, 1)],
            Some(tracked) if tracked.date < today => {
                vec![(tracked.date, tracked.number.saturating_add(1)), (today, 1)]
            }
            Some(tracked) => vec![(tracked.date, tracked.number.saturating_add(1))],
        };

        for (date, start) in scans {
            let scan = self.scan_date(target, date, start).await?;
            total.probes += scan.probes;
            total.best = total.best.max(scan.best);
        }

        info!(
            target = %target.display_name(),
            current = ?current.map(|b| b.to_string()),
            found = ?total.best.map(|b| b.to_string()),
            probes = total.probes,
            "[DISCOVER] Scan finished"
        );
        Ok(total)
    }

    async fn scan_date(
        &self,
        target: &PollingTarget,
        date: NaiveDate,
        start: u32,
    ) -> Result<Discovery, RepositoryError> {
        let mut best = None;
        let mut misses = 0;
        let mut probes = 0;
        let mut number = start.max(1);

        while number <= self.limits.max_build_number
            && misses < self.limits.max_consecutive_misses
        {
            let candidate = BuildId::new(date, number);
            let url = self.locator.build_url(target, &candidate)?;
            probes += 1;
            if self.repository.probe(&url).await {
                debug!(build = %candidate, "[DISCOVER] Candidate exists");
                best = Some(candidate);
                misses = 0;
            } else {
                misses += 1;
            }
            number += 1;
        }

        Ok(Discovery { best, probes })
    }
}
