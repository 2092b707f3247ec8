//! Thread-safe cache and request coalescing over a `MarketDataSource`, plus
//! the per-trade-date candidate pool preload the scheduler runs before
//! fanning out to agents.

use super::source::{Bar, MarketDataSource, StockBasic};
use crate::models::{CandidatePool, CandidateSource, CandidateStock, HotSector, TradeDate};
use crate::news::NewsSource;
use anyhow::Result;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, Notify};
use tracing::{debug, warn};

const COALESCE_WAIT: Duration = Duration::from_secs(30);
const DEFAULT_BATCH_SIZE: usize = 200;

pub struct MarketDataProvider {
    source: Arc<dyn MarketDataSource>,
    news: Arc<dyn NewsSource>,
    max_price: f64,
    batch_size: usize,

    bar_cache: Mutex<HashMap<(String, TradeDate), Arc<Bar>>>,
    bar_inflight: Mutex<HashMap<(String, TradeDate), Arc<Notify>>>,
    calendar_cache: Mutex<HashMap<(TradeDate, TradeDate), Arc<Vec<TradeDate>>>>,
    basic_cache: Mutex<HashMap<String, Arc<Option<StockBasic>>>>,
    candidate_cache: Mutex<HashMap<TradeDate, Arc<CandidatePool>>>,
}

impl MarketDataProvider {
    pub fn new(source: Arc<dyn MarketDataSource>, news: Arc<dyn NewsSource>, max_price: f64) -> Self {
        Self {
            source,
            news,
            max_price,
            batch_size: DEFAULT_BATCH_SIZE,
            bar_cache: Mutex::new(HashMap::new()),
            bar_inflight: Mutex::new(HashMap::new()),
            calendar_cache: Mutex::new(HashMap::new()),
            basic_cache: Mutex::new(HashMap::new()),
            candidate_cache: Mutex::new(HashMap::new()),
        }
    }

    async fn fetch_and_cache_bar(&self, key: &(String, TradeDate)) -> Result<Option<Arc<Bar>>> {
        let fetched = self.source.daily_bar(&key.0, key.1).await?;
        if let Some(bar) = fetched {
            let arc = Arc::new(bar);
            self.bar_cache.lock().await.insert(key.clone(), arc.clone());
            Ok(Some(arc))
        } else {
            Ok(None)
        }
    }

    /// Coalesced, cached bar lookup. Concurrent callers for the same
    /// `(code, date)` share one underlying fetch; a waiter that doesn't hear
    /// back within 30s issues its own fetch rather than hanging forever.
    pub async fn daily_bar(&self, code: &str, date: TradeDate) -> Result<Option<Arc<Bar>>> {
        let key = (code.to_string(), date);

        if let Some(cached) = self.bar_cache.lock().await.get(&key).cloned() {
            return Ok(Some(cached));
        }

        let existing_notify = {
            let mut inflight = self.bar_inflight.lock().await;
            if let Some(n) = inflight.get(&key).cloned() {
                Some(n)
            } else {
                inflight.insert(key.clone(), Arc::new(Notify::new()));
                None
            }
        };

        if let Some(notify) = existing_notify {
            if tokio::time::timeout(COALESCE_WAIT, notify.notified())
                .await
                .is_ok()
            {
                if let Some(cached) = self.bar_cache.lock().await.get(&key).cloned() {
                    return Ok(Some(cached));
                }
            }
            // Timed out or the leader's fetch produced nothing cacheable;
            // fall through to an independent fetch. Pathological under
            // sustained contention, but it terminates.
            return self.fetch_and_cache_bar(&key).await;
        }

        let result = self.fetch_and_cache_bar(&key).await;
        if let Some(notify) = self.bar_inflight.lock().await.remove(&key) {
            notify.notify_waiters();
        }
        result
    }

    pub async fn trade_calendar(
        &self,
        start: TradeDate,
        end: TradeDate,
    ) -> Result<Arc<Vec<TradeDate>>> {
        let key = (start, end);
        if let Some(cached) = self.calendar_cache.lock().await.get(&key).cloned() {
            return Ok(cached);
        }
        let calendar = Arc::new(self.source.trade_calendar(start, end).await?);
        self.calendar_cache.lock().await.insert(key, calendar.clone());
        Ok(calendar)
    }

    pub async fn stock_basic(&self, code: &str) -> Result<Arc<Option<StockBasic>>> {
        if let Some(cached) = self.basic_cache.lock().await.get(code).cloned() {
            return Ok(cached);
        }
        let basic = Arc::new(self.source.stock_basic(code).await?);
        self.basic_cache
            .lock()
            .await
            .insert(code.to_string(), basic.clone());
        Ok(basic)
    }

    fn passes_filters(basic: &StockBasic, bar: &Bar, max_price: f64) -> bool {
        !basic.is_st && !basic.is_delisted && bar.close > 0.0 && bar.volume > 0.0 && bar.close <= max_price
    }

    async fn build_candidate(&self, code: &str, date: TradeDate) -> Option<CandidateStock> {
        let basic = self.stock_basic(code).await.ok()??;
        let bar = self.daily_bar(code, date).await.ok()??;
        if !Self::passes_filters(&basic, &bar, self.max_price) {
            return None;
        }
        Some(CandidateStock {
            code: code.to_string(),
            name: basic.name.clone(),
            close: bar.close,
            change_pct: bar.change_pct,
            volume: bar.volume,
            is_hot: false,
        })
    }

    /// Called once by the scheduler before fan-out for date D.
    pub async fn preload(&self, date: TradeDate) -> Result<Arc<CandidatePool>> {
        let pool = match self.try_preload(date).await {
            Ok(pool) if !pool.candidates.is_empty() => pool,
            Ok(empty) => {
                debug!(%date, "preload produced an empty pool, falling back");
                self.fallback(date).await.unwrap_or(empty)
            }
            Err(e) => {
                warn!(%date, error = %e, "preload failed, falling back to linear whitelist walk");
                self.fallback(date).await?
            }
        };
        let arc = Arc::new(pool);
        self.candidate_cache.lock().await.insert(date, arc.clone());
        Ok(arc)
    }

    async fn try_preload(&self, date: TradeDate) -> Result<CandidatePool> {
        let hot_codes: std::collections::HashSet<String> =
            self.news.hot_codes(date, 200).await?.into_iter().collect();
        let hot_sectors = self.news.hot_sectors(date, 20).await?;
        let whitelist = self.source.whitelist().await?;

        let mut ordered: Vec<String> = whitelist
            .iter()
            .filter(|c| hot_codes.contains(*c))
            .cloned()
            .collect();
        ordered.extend(whitelist.iter().filter(|c| !hot_codes.contains(*c)).cloned());
        ordered.truncate(self.batch_size);

        let mut candidates = Vec::new();
        for code in &ordered {
            if let Some(mut candidate) = self.build_candidate(code, date).await {
                candidate.is_hot = hot_codes.contains(code);
                candidates.push(candidate);
            }
        }

        Ok(CandidatePool {
            date,
            candidates,
            hot_codes,
            hot_sectors,
            source: CandidateSource::Preload,
        })
    }

    async fn fallback(&self, date: TradeDate) -> Result<CandidatePool> {
        let whitelist = self.source.whitelist().await?;
        let mut candidates = Vec::new();
        for code in whitelist.iter().take(self.batch_size) {
            if let Some(candidate) = self.build_candidate(code, date).await {
                candidates.push(candidate);
            }
        }
        Ok(CandidatePool {
            date,
            candidates,
            hot_codes: std::collections::HashSet::new(),
            hot_sectors: Vec::new(),
            source: CandidateSource::Fallback,
        })
    }

    pub async fn candidate_pool(&self, date: TradeDate) -> Option<Arc<CandidatePool>> {
        self.candidate_cache.lock().await.get(&date).cloned()
    }

    pub async fn hot_sectors(&self, date: TradeDate) -> Result<Vec<HotSector>> {
        self.news.hot_sectors(date, 20).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::market::source::StubMarketDataSource;
    use crate::news::StubNewsSource;

    fn date(s: &str) -> TradeDate {
        TradeDate::parse(s).unwrap()
    }

    #[tokio::test]
    async fn preload_filters_st_and_zero_volume() {
        let d = date("20250106");
        let source = StubMarketDataSource::new(vec![d])
            .with_basic(StockBasic {
                code: "000001.SZ".into(),
                name: "Ping An Bank".into(),
                is_st: false,
                is_delisted: false,
            })
            .with_basic(StockBasic {
                code: "ST999.SZ".into(),
                name: "ST Junk".into(),
                is_st: true,
                is_delisted: false,
            })
            .with_bar(
                "000001.SZ",
                d,
                Bar {
                    close: 10.0,
                    volume: 1000.0,
                    change_pct: 1.0,
                },
            )
            .with_bar(
                "ST999.SZ",
                d,
                Bar {
                    close: 3.0,
                    volume: 1000.0,
                    change_pct: 1.0,
                },
            );

        let provider = MarketDataProvider::new(Arc::new(source), Arc::new(StubNewsSource), 200.0);
        let pool = provider.preload(d).await.unwrap();
        assert_eq!(pool.candidates.len(), 1);
        assert_eq!(pool.candidates[0].code, "000001.SZ");
    }

    #[tokio::test]
    async fn bar_lookup_is_cached() {
        let d = date("20250106");
        let source =
            StubMarketDataSource::new(vec![d]).with_bar(
                "000001.SZ",
                d,
                Bar {
                    close: 10.0,
                    volume: 1.0,
                    change_pct: 0.0,
                },
            );
        let provider = MarketDataProvider::new(Arc::new(source), Arc::new(StubNewsSource), 200.0);
        let first = provider.daily_bar("000001.SZ", d).await.unwrap().unwrap();
        let second = provider.daily_bar("000001.SZ", d).await.unwrap().unwrap();
        assert!(Arc::ptr_eq(&first, &second));
    }
}
