//! End-to-end arena run against stub collaborators: the scheduler advances
//! two agents through a short calendar, persists every day, and the store
//! reflects the final state.

use std::sync::Arc;

use trading_arena::agent::AgentIdentity;
use trading_arena::config::ArenaConfig;
use trading_arena::llm::ScriptedLlmClient;
use trading_arena::market::{MarketDataProvider, StubMarketDataSource};
use trading_arena::models::TradeDate;
use trading_arena::news::StubNewsSource;
use trading_arena::persistence::Db;
use trading_arena::portfolio::PortfolioBook;
use trading_arena::recovery;
use trading_arena::scheduler::ArenaScheduler;
use trading_arena::store::MemoryStore;

fn date(s: &str) -> TradeDate {
    TradeDate::parse(s).unwrap()
}

fn tmp_db() -> (Db, tempfile::TempDir) {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("arena.db");
    (Db::open(path.to_str().unwrap()).unwrap(), dir)
}

#[tokio::test]
async fn two_agents_run_a_short_calendar_and_persist_every_day() {
    let (db, _dir) = tmp_db();
    let db = Arc::new(db);
    let store = Arc::new(MemoryStore::new());

    let d0 = date("20250106");
    let d1 = date("20250107");
    let source = StubMarketDataSource::new(vec![d0, d1]);
    let market = Arc::new(MarketDataProvider::new(Arc::new(source), Arc::new(StubNewsSource), 200.0));
    let news = Arc::new(StubNewsSource);
    let llm = Arc::new(ScriptedLlmClient::new(Vec::new()));

    // Huge min_cash_to_buy keeps find_candidates a no-op, so the pipeline
    // never needs a scripted LLM response for either agent.
    let config = ArenaConfig {
        min_cash_to_buy: 1_000_000.0,
        enable_reflection: false,
        ..ArenaConfig::default()
    };

    let session_id = "test-session";
    db.create_session(session_id, d0, d1, config.initial_capital, 1).await.unwrap();

    let agents = vec![
        (
            AgentIdentity { name: "agent_a".into(), model_id: "m".into(), model_offset: 0 },
            PortfolioBook::new(config.initial_capital, d0),
        ),
        (
            AgentIdentity { name: "agent_b".into(), model_id: "m".into(), model_offset: 1 },
            PortfolioBook::new(config.initial_capital, d0),
        ),
    ];

    let scheduler = ArenaScheduler::new(config, market, news, llm, db.clone(), store.clone());
    let should_stop: Arc<dyn Fn() -> bool + Send + Sync> = Arc::new(|| false);

    let results = scheduler
        .run_arena(session_id, d0, d1, agents, should_stop, |_update| {})
        .await
        .unwrap();

    assert_eq!(results.len(), 2);
    for name in ["agent_a", "agent_b"] {
        let daily = db.daily_assets(session_id, name).await.unwrap();
        assert_eq!(daily.len(), 2, "expected one point per trading day for {name}");
        assert_eq!(daily[1].date, d1);

        let snapshot = store.agent(name).expect("agent should be in the store");
        assert_eq!(snapshot.last_updated, Some(d1));
    }

    let progress = store.progress();
    assert_eq!(progress.current_day, 2);
    assert_eq!(progress.total_days, 2);
    assert!(!progress.is_running);
}

#[tokio::test]
async fn resumed_session_replays_from_persisted_state() {
    let (db, _dir) = tmp_db();
    let d0 = date("20250106");
    let d1 = date("20250107");

    db.create_session("s1", d0, d1, 10000.0, 1).await.unwrap();
    db.upsert_daily_asset(
        "s1",
        "agent_a",
        &trading_arena::models::DailyAssetPoint { date: d0, total_assets: 10000.0, cash: 10000.0, holdings_value: 0.0 },
    )
    .await
    .unwrap();
    db.update_session_progress("s1", d0, trading_arena::models::SessionStatus::Running, 1).await.unwrap();

    let agent_names = vec!["agent_a".to_string()];
    let to_resume = recovery::find_session_to_resume(&db, &agent_names)
        .await
        .unwrap()
        .expect("a running session");
    assert_eq!(to_resume.id, "s1");

    let market = Arc::new(MarketDataProvider::new(
        Arc::new(StubMarketDataSource::new(vec![d0, d1])),
        Arc::new(StubNewsSource),
        200.0,
    ));
    let identity = AgentIdentity { name: "agent_a".into(), model_id: "m".into(), model_offset: 0 };
    let recovered = recovery::resume_agent(&db, &to_resume.id, identity, d0, 10000.0, &market)
        .await
        .unwrap();

    assert!(recovered.rolled_back_to.is_none());
    assert_eq!(recovered.book.daily_assets.len(), 1);
    assert_eq!(recovered.book.cash, 10000.0);
}
