// Integration tests for the rent estimation state machine, driven through a
// scripted fake session provider instead of a live tor/browser pair.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;

use rentometer_cli::listing::{ListingSummary, Unit};
use rentometer_cli::rentometer::{
    BathsFilter, EstimateCache, EstimateCollection, EstimateKind, QueryOutcome, RentEstimator,
    RetryPolicy, SessionError, SessionProvider, UnitQuerySession,
};

/// Shared script + observation log for a fake provider.
#[derive(Default)]
struct Script {
    /// Scripted answers for quota probes; exhausted entries default to true.
    quota: VecDeque<bool>,
    /// Scripted outcomes for submissions; exhausted entries default to a
    /// results page with all four stats.
    outcomes: VecDeque<Result<QueryOutcome, String>>,
    acquisitions: usize,
    shutdowns: usize,
    submissions: Vec<(String, Unit, BathsFilter)>,
}

#[derive(Clone)]
struct FakeProvider {
    script: Arc<Mutex<Script>>,
}

impl FakeProvider {
    fn new(script: Script) -> Self {
        Self {
            script: Arc::new(Mutex::new(script)),
        }
    }

    fn log(&self) -> Arc<Mutex<Script>> {
        self.script.clone()
    }
}

struct FakeSession {
    script: Arc<Mutex<Script>>,
}

#[async_trait]
impl SessionProvider for FakeProvider {
    type Session = FakeSession;

    async fn acquire(&mut self) -> Result<FakeSession, SessionError> {
        let mut script = self.script.lock().unwrap();
        script.acquisitions += 1;
        Ok(FakeSession {
            script: self.script.clone(),
        })
    }
}

#[async_trait]
impl UnitQuerySession for FakeSession {
    async fn quota_available(&mut self) -> Result<bool> {
        let mut script = self.script.lock().unwrap();
        Ok(script.quota.pop_front().unwrap_or(true))
    }

    async fn submit_query(
        &mut self,
        address: &str,
        unit: &Unit,
        filter: BathsFilter,
    ) -> Result<QueryOutcome> {
        let mut script = self.script.lock().unwrap();
        script.submissions.push((address.to_string(), *unit, filter));
        match script.outcomes.pop_front() {
            Some(Ok(outcome)) => Ok(outcome),
            Some(Err(message)) => Err(anyhow::anyhow!(message)),
            None => Ok(QueryOutcome::ResultsPage(full_results_page())),
        }
    }

    async fn shutdown(&mut self) {
        self.script.lock().unwrap().shutdowns += 1;
    }
}

fn full_results_page() -> String {
    r#"
    <html><body>
      <div class="box-stats">AVERAGE<br>$1,495 /mo</div>
      <div class="box-stats">MEDIAN<br>$1,450 /mo</div>
      <div class="box-stats">25TH PERCENTILE<br>$1,200 /mo</div>
      <div class="box-stats">75TH PERCENTILE<br>$1,700 /mo</div>
    </body></html>
    "#
    .to_string()
}

fn partial_results_page() -> String {
    r#"
    <html><body>
      <div class="box-stats">AVERAGE<br>$1,495 /mo</div>
      <div class="box-stats">MEDIAN<br>$1,450 /mo</div>
      <div class="box-stats">25TH PERCENTILE<br>$1,200 /mo</div>
    </body></html>
    "#
    .to_string()
}

fn listing(units: Vec<Unit>) -> ListingSummary {
    ListingSummary {
        address: "689 Auburn Street, Manchester, NH 03103".to_string(),
        price: 450_000.0,
        units,
    }
}

fn temp_cache(name: &str) -> EstimateCache {
    let dir = std::env::temp_dir().join(format!("rentometer-estimator-test-{}", name));
    let _ = std::fs::remove_dir_all(&dir);
    EstimateCache::new(dir)
}

fn fast_retry(max_session_attempts: u32) -> RetryPolicy {
    RetryPolicy {
        max_session_attempts,
        base_backoff: Duration::from_millis(1),
        max_backoff: Duration::from_millis(2),
    }
}

fn estimator(
    provider: FakeProvider,
    cache: EstimateCache,
    attempts: u32,
) -> RentEstimator<FakeProvider> {
    RentEstimator::new(provider, cache).with_retry_policy(fast_retry(attempts))
}

#[tokio::test]
async fn cache_hit_skips_the_network_entirely() {
    let cache = temp_cache("cache-hit");
    let unit = Unit {
        beds: 3.0,
        baths: 1.0,
    };
    let listing = listing(vec![unit]);

    let mut cached = EstimateCollection::new();
    cached.record(EstimateKind::Average, unit, 1494.0);
    cache.store(&listing.address, &cached).unwrap();

    let provider = FakeProvider::new(Script::default());
    let log = provider.log();

    let cache = EstimateCache::new(cache.root().to_path_buf());
    let result = estimator(provider, cache, 8).estimate(&listing).await.unwrap();

    assert_eq!(result, cached);
    let script = log.lock().unwrap();
    assert_eq!(script.acquisitions, 0, "no session should be created on a cache hit");

    let _ = std::fs::remove_dir_all(std::env::temp_dir().join("rentometer-estimator-test-cache-hit"));
}

#[tokio::test]
async fn quota_exhaustion_recycles_sessions_until_one_works() {
    let cache = temp_cache("quota-recovery");
    let listing = listing(vec![Unit {
        beds: 2.0,
        baths: 1.0,
    }]);

    // Disabled on the first two acquisitions, enabled on the third; the
    // per-unit re-probe afterwards defaults to enabled.
    let provider = FakeProvider::new(Script {
        quota: VecDeque::from([false, false, true]),
        ..Script::default()
    });
    let log = provider.log();

    let result = estimator(provider, cache, 8).estimate(&listing).await.unwrap();

    assert_eq!(result.total_estimates(), 4);
    let script = log.lock().unwrap();
    assert_eq!(script.acquisitions, 3, "expected exactly 3 acquire/probe cycles");
    // two throttled pairs torn down plus the final teardown
    assert_eq!(script.shutdowns, 3);
    assert_eq!(script.submissions.len(), 1);

    let _ = std::fs::remove_dir_all(std::env::temp_dir().join("rentometer-estimator-test-quota-recovery"));
}

#[tokio::test]
async fn insufficient_data_broadens_once_then_records_zeroes() {
    let cache = temp_cache("insufficient");
    let unit1 = Unit {
        beds: 3.0,
        baths: 1.0,
    };
    let unit2 = Unit {
        beds: 2.0,
        baths: 1.0,
    };
    let listing = listing(vec![unit1, unit2]);

    let provider = FakeProvider::new(Script {
        outcomes: VecDeque::from([
            Ok(QueryOutcome::Insufficient),
            Ok(QueryOutcome::Insufficient),
        ]),
        ..Script::default()
    });
    let log = provider.log();

    let result = estimator(provider, cache, 8).estimate(&listing).await.unwrap();

    // unit1 gets a zero for every kind, unit2 a real estimate for every kind
    assert_eq!(result.total_estimates(), 8);
    for kind in EstimateKind::ALL {
        let group = result.group(kind).expect("group should exist");
        assert_eq!(group.units.len(), 2);
        assert_eq!(group.units[0].unit, unit1);
        assert_eq!(group.units[0].monthly_rent, 0.0);
        assert!(group.units[1].monthly_rent > 0.0);
    }

    let script = log.lock().unwrap();
    assert_eq!(script.submissions.len(), 3);
    // exact-bath filter first, then the broadened retry
    assert_eq!(script.submissions[0].2, BathsFilter::OneOnly);
    assert_eq!(script.submissions[1].2, BathsFilter::Any);
    assert_eq!(script.submissions[2].2, BathsFilter::OneOnly);

    let _ = std::fs::remove_dir_all(std::env::temp_dir().join("rentometer-estimator-test-insufficient"));
}

#[tokio::test]
async fn partial_stat_kinds_are_kept() {
    let cache = temp_cache("partial-kinds");
    let listing = listing(vec![Unit {
        beds: 1.0,
        baths: 1.0,
    }]);

    let provider = FakeProvider::new(Script {
        outcomes: VecDeque::from([Ok(QueryOutcome::ResultsPage(partial_results_page()))]),
        ..Script::default()
    });

    let result = estimator(provider, cache, 8).estimate(&listing).await.unwrap();

    assert_eq!(result.total_estimates(), 3);
    assert!(result.group(EstimateKind::Percentile75).is_none());

    let _ = std::fs::remove_dir_all(std::env::temp_dir().join("rentometer-estimator-test-partial-kinds"));
}

#[tokio::test]
async fn run_level_faults_keep_partial_results_and_tear_down_once() {
    let cache = temp_cache("fault-containment");
    let listing = listing(vec![
        Unit {
            beds: 3.0,
            baths: 1.0,
        },
        Unit {
            beds: 2.0,
            baths: 1.0,
        },
        Unit {
            beds: 1.0,
            baths: 1.0,
        },
    ]);

    let provider = FakeProvider::new(Script {
        outcomes: VecDeque::from([
            Ok(QueryOutcome::ResultsPage(full_results_page())),
            Err("browser fell over".to_string()),
        ]),
        ..Script::default()
    });
    let log = provider.log();

    let cache_root = cache.root().to_path_buf();
    let result = estimator(provider, cache, 8).estimate(&listing).await.unwrap();

    // only unit 1 was recorded before the fault
    assert_eq!(result.total_estimates(), 4);
    for kind in EstimateKind::ALL {
        assert_eq!(result.group(kind).unwrap().units.len(), 1);
    }

    let script = log.lock().unwrap();
    assert_eq!(script.submissions.len(), 2, "unit 3 must never be queried");
    assert_eq!(script.shutdowns, 1, "the session pair is torn down exactly once");

    // the partial collection was cached
    let reread = EstimateCache::new(cache_root.clone());
    assert_eq!(reread.load(&listing.address).unwrap(), Some(result));

    let _ = std::fs::remove_dir_all(cache_root);
}

#[tokio::test]
async fn exhausted_retries_finalize_with_nothing_collected() {
    let cache = temp_cache("exhausted");
    let listing = listing(vec![Unit {
        beds: 2.0,
        baths: 2.0,
    }]);

    let provider = FakeProvider::new(Script {
        quota: VecDeque::from([false, false, false]),
        ..Script::default()
    });
    let log = provider.log();

    let cache_root = cache.root().to_path_buf();
    let result = estimator(provider, cache, 3).estimate(&listing).await.unwrap();

    assert!(result.is_empty());
    let script = log.lock().unwrap();
    assert_eq!(script.acquisitions, 3);
    assert_eq!(script.shutdowns, 3);
    assert!(script.submissions.is_empty());

    // nothing collected, so nothing cached
    let reread = EstimateCache::new(cache_root.clone());
    assert_eq!(reread.load(&listing.address).unwrap(), None);

    let _ = std::fs::remove_dir_all(cache_root);
}
