//! In-process read model the HTTP API serves from. Single writer (the
//! scheduler, after each barrier); many readers (HTTP handlers).

use crate::models::{DailyAssetPoint, Holding, RankingContext, TradeDate};
use parking_lot::RwLock;
use serde::Serialize;
use std::collections::HashMap;

#[derive(Debug, Clone, Serialize)]
pub struct AgentSnapshot {
    pub agent_name: String,
    pub model_id: String,
    pub cash: f64,
    pub total_assets: f64,
    pub holdings: Vec<Holding>,
    pub daily_assets: Vec<DailyAssetPoint>,
    pub last_updated: Option<TradeDate>,
    pub ranking: Option<RankingContext>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ProgressSnapshot {
    pub current_day: usize,
    pub total_days: usize,
    pub current_date: Option<TradeDate>,
    pub is_running: bool,
    pub message: String,
}

#[derive(Default)]
pub struct MemoryStore {
    agents: RwLock<HashMap<String, AgentSnapshot>>,
    progress: RwLock<ProgressSnapshot>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update_agent(&self, snapshot: AgentSnapshot) {
        self.agents.write().insert(snapshot.agent_name.clone(), snapshot);
    }

    pub fn agent(&self, name: &str) -> Option<AgentSnapshot> {
        self.agents.read().get(name).cloned()
    }

    pub fn all_agents(&self) -> Vec<AgentSnapshot> {
        self.agents.read().values().cloned().collect()
    }

    pub fn set_progress(&self, progress: ProgressSnapshot) {
        *self.progress.write() = progress;
    }

    pub fn progress(&self) -> ProgressSnapshot {
        self.progress.read().clone()
    }

    pub fn clear(&self) {
        self.agents.write().clear();
        *self.progress.write() = ProgressSnapshot::default();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn last_writer_wins_per_agent() {
        let store = MemoryStore::new();
        store.update_agent(AgentSnapshot {
            agent_name: "a".into(),
            model_id: "m".into(),
            cash: 100.0,
            total_assets: 100.0,
            holdings: Vec::new(),
            daily_assets: Vec::new(),
            last_updated: None,
            ranking: None,
        });
        store.update_agent(AgentSnapshot {
            agent_name: "a".into(),
            model_id: "m".into(),
            cash: 50.0,
            total_assets: 200.0,
            holdings: Vec::new(),
            daily_assets: Vec::new(),
            last_updated: None,
            ranking: None,
        });
        assert_eq!(store.agent("a").unwrap().cash, 50.0);
        assert_eq!(store.all_agents().len(), 1);
    }
}
