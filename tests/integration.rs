use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use weather_agent::config::{Config, TradingMode};
use weather_agent::db::Database;
use weather_agent::kalshi::{Action, KalshiAuth, KalshiClient, Side};
use weather_agent::lockin;
use weather_agent::orchestrator::{PositionView, TradingBot};
use weather_agent::paper;
use weather_agent::signals::{MarketType, Signal, SignalSource, Strike};
use weather_agent::weather::WeatherClient;

fn test_auth() -> KalshiAuth {
    let key = rsa::RsaPrivateKey::new(&mut rand::thread_rng(), 2048).expect("keygen");
    let pem =
        rsa::pkcs1::EncodeRsaPrivateKey::to_pkcs1_pem(&key, rsa::pkcs1::LineEnding::LF)
            .expect("pem");
    KalshiAuth::new("test-key", pem.as_ref()).expect("auth")
}

fn paper_bot() -> TradingBot {
    let config = Config::from_env().unwrap();
    let db = Database::open_in_memory().unwrap();
    let client = KalshiClient::new("http://127.0.0.1:1", None, 1).unwrap();
    let weather =
        WeatherClient::with_base_urls("http://127.0.0.1:1".into(), "http://127.0.0.1:1".into())
            .unwrap();
    TradingBot::with_parts(config, db, client, weather)
}

async fn live_bot(server: &MockServer) -> TradingBot {
    let mut config = Config::from_env().unwrap();
    config.trading_mode = TradingMode::Live;
    let db = Database::open_in_memory().unwrap();
    let client = KalshiClient::new(&server.uri(), Some(test_auth()), 5).unwrap();
    let weather =
        WeatherClient::with_base_urls("http://127.0.0.1:1".into(), "http://127.0.0.1:1".into())
            .unwrap();
    TradingBot::with_parts(config, db, client, weather)
}

fn no_signal(ticker: &str, yes_price: i64, edge: f64, source: SignalSource) -> Signal {
    Signal {
        city: "NYC".to_string(),
        market_type: MarketType::High,
        event_ticker: "KXHIGHNY-26FEB18".to_string(),
        market_ticker: ticker.to_string(),
        action: Action::Buy,
        side: Side::No,
        suggested_price_cents: 100 - yes_price,
        confidence: 0.8,
        edge_pct: edge,
        reason: "integration".to_string(),
        current_temp_f: 41.0,
        forecast_temp_f: 44.0,
        surrounding_avg_f: 40.5,
        market_yes_price_cents: yes_price,
        is_tomorrow: false,
        margin_f: 5.0,
        signal_source: source,
        strike: Some(Strike::Bracket { floor: 50.0, cap: 51.0 }),
        our_probability: 0.03,
    }
}

#[test]
fn test_database_tables_created() {
    let db = Database::open_in_memory().unwrap();
    let tables: Vec<String> = db
        .conn
        .prepare("SELECT name FROM sqlite_master WHERE type='table' ORDER BY name")
        .unwrap()
        .query_map([], |row| row.get(0))
        .unwrap()
        .filter_map(|r| r.ok())
        .collect();

    for table in [
        "observations",
        "forecasts",
        "metar_daily_extremes",
        "prediction_log",
        "trade_journal",
        "paper_trades",
        "paper_balance",
        "settled_markets",
        "orderbook_snapshots",
    ] {
        assert!(tables.contains(&table.to_string()), "missing {}", table);
    }
}

#[test]
fn test_config_defaults_to_paper() {
    let config = Config::from_env().unwrap();
    assert_eq!(config.trading_mode, TradingMode::Paper);
    assert!(!config.kill_switch);
}

/// Scenario: a paper NO opened at 20¢ × 10 and closed at yes_bid 5 realizes
/// (100 − 5 − 20) × 10 and lands the balance at exactly 10,750¢.
#[test]
fn test_paper_no_pnl_end_to_end() {
    let db = Database::open_in_memory().unwrap();
    let risk = Config::from_env().unwrap().risk;

    let fill = paper::open_trade(&db, &no_signal("T1", 80, 50.0, SignalSource::Model), 10, &risk)
        .unwrap()
        .unwrap();
    assert_eq!(fill.cost_cents, 200);
    assert_eq!(paper::balance(&db).unwrap(), 9_800);

    let credit = paper::close_position(&db, "T1", "no", 10, 5).unwrap();
    assert_eq!(credit, 950);
    assert_eq!(paper::balance(&db).unwrap(), 10_750);

    let pnl: i64 = db
        .conn
        .query_row(
            "SELECT pnl_cents FROM paper_trades WHERE settled = 1",
            [],
            |r| r.get(0),
        )
        .unwrap();
    assert_eq!(pnl, 750);
}

/// Scenario: a model signal with 95% edge on a liquid 25¢ market is blocked
/// by the sanity gate; the identical lock-in signal trades.
#[tokio::test]
async fn test_sanity_gate_distinguishes_sources() {
    let bot = paper_bot();

    let model = no_signal("T1", 25, 95.0, SignalSource::Model);
    assert!(bot.execute_signal(&model).await.unwrap().is_none());
    assert_eq!(paper::todays_trade_count(&bot.db).unwrap(), 0);

    let lockin = no_signal("T1", 25, 95.0, SignalSource::MetarLockin);
    assert!(bot.execute_signal(&lockin).await.unwrap().is_some());
    assert_eq!(paper::todays_trade_count(&bot.db).unwrap(), 1);
}

/// Scenario: with 8,000¢ of open exposure against a 18,000¢ account, the 40%
/// capital cap (7,200¢) rejects any new signal.
#[tokio::test]
async fn test_capital_cap_rejects_new_signals() {
    let bot = paper_bot();
    paper::ensure_seeded(&bot.db).unwrap();

    // Ten open NO rows of 10 contracts at 80¢ each (prior-day entries).
    for i in 0..10 {
        bot.db
            .conn
            .execute(
                "INSERT INTO paper_trades (city, market_type, event_ticker, market_ticker, action, side, price_cents, contracts, settled, created_at)
                 VALUES ('NYC', 'high', 'E', ?1, 'buy', 'no', 80, 10, 0, datetime('now'))",
                [format!("POS{}", i)],
            )
            .unwrap();
    }

    // Unpriceable positions fall back to cost, so account value is
    // 10,000 cash + 8,000 exposure = 18,000 and the cap is 7,200.
    let result = bot
        .execute_signal(&no_signal("NEW", 30, 50.0, SignalSource::Model))
        .await
        .unwrap();
    assert!(result.is_none());
}

/// Scenario: profit-rule liquidation of a winning NO position issues exactly
/// one (sell, no, count=5, no_price=15) order — never a buy.
#[tokio::test]
async fn test_profit_rule_close_order_shape() {
    let server = MockServer::start().await;
    let bot = live_bot(&server).await;

    Mock::given(method("GET"))
        .and(path("/trade-api/v2/markets/KXHIGHNY-26FEB18-B48.5"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "market": {
                "ticker": "KXHIGHNY-26FEB18-B48.5", "status": "active",
                "yes_bid": 80, "yes_ask": 85, "no_bid": 10, "no_ask": 15
            }
        })))
        .mount(&server)
        .await;

    Mock::given(method("POST"))
        .and(path("/trade-api/v2/portfolio/orders"))
        .respond_with(ResponseTemplate::new(201).set_body_json(serde_json::json!({
            "order": {
                "order_id": "ord-1", "ticker": "KXHIGHNY-26FEB18-B48.5",
                "side": "no", "action": "sell", "status": "resting", "no_price": 15
            }
        })))
        .expect(1)
        .mount(&server)
        .await;

    // NO position: received 80¢ × 5 = 400¢; closing costs 15¢ < 80¢ → winner
    let positions = vec![PositionView {
        ticker: "KXHIGHNY-26FEB18-B48.5".to_string(),
        position: -5,
        market_exposure: 400,
    }];
    bot.liquidate_winning_positions(&positions).await;

    let requests = server.received_requests().await.unwrap();
    let order_req = requests
        .iter()
        .find(|r| r.url.path() == "/trade-api/v2/portfolio/orders")
        .expect("order was placed");
    let body: serde_json::Value = serde_json::from_slice(&order_req.body).unwrap();
    assert_eq!(body["action"], "sell");
    assert_eq!(body["side"], "no");
    assert_eq!(body["count"], 5);
    assert_eq!(body["no_price"], 15);
    assert!(body.get("yes_price").is_none());
}

/// Scenario: an unprofitable NO position is left alone by the liquidation.
#[tokio::test]
async fn test_liquidation_skips_losers() {
    let server = MockServer::start().await;
    let bot = live_bot(&server).await;

    Mock::given(method("GET"))
        .and(path("/trade-api/v2/markets/T1"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "market": {"ticker": "T1", "status": "active",
                        "yes_bid": 20, "yes_ask": 25, "no_bid": 75, "no_ask": 80}
        })))
        .mount(&server)
        .await;

    // Received 50¢/contract but closing now costs 80¢ → not profitable
    let positions = vec![PositionView {
        ticker: "T1".to_string(),
        position: -4,
        market_exposure: 200,
    }];
    bot.liquidate_winning_positions(&positions).await;

    let requests = server.received_requests().await.unwrap();
    assert!(requests
        .iter()
        .all(|r| r.url.path() != "/trade-api/v2/portfolio/orders"));
}

/// Scenario: a NO position 62.5% underwater with a live 30¢ NO bid is cut
/// with a (sell, no, count=5, no_price=30) order.
#[tokio::test]
async fn test_cut_losers_order_shape() {
    let server = MockServer::start().await;
    let bot = live_bot(&server).await;

    Mock::given(method("GET"))
        .and(path("/trade-api/v2/portfolio/positions"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "market_positions": [
                {"ticker": "T1", "position": -5, "market_exposure": 400}
            ],
            "cursor": null
        })))
        .mount(&server)
        .await;

    Mock::given(method("GET"))
        .and(path("/trade-api/v2/markets/T1"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "market": {"ticker": "T1", "status": "active",
                        "yes_bid": 70, "yes_ask": 75, "no_bid": 30, "no_ask": 35}
        })))
        .mount(&server)
        .await;

    Mock::given(method("POST"))
        .and(path("/trade-api/v2/portfolio/orders"))
        .respond_with(ResponseTemplate::new(201).set_body_json(serde_json::json!({
            "order": {"order_id": "ord-2", "ticker": "T1", "side": "no",
                       "action": "sell", "status": "resting", "no_price": 30}
        })))
        .expect(1)
        .mount(&server)
        .await;

    // Value to close ≈ 5 × (100 − 70) = 150; loss = (400 − 150)/400 = 62.5%
    bot.cut_losers().await;

    let requests = server.received_requests().await.unwrap();
    let order_req = requests
        .iter()
        .find(|r| r.url.path() == "/trade-api/v2/portfolio/orders")
        .expect("cut order was placed");
    let body: serde_json::Value = serde_json::from_slice(&order_req.body).unwrap();
    assert_eq!(body["action"], "sell");
    assert_eq!(body["side"], "no");
    assert_eq!(body["count"], 5);
    assert_eq!(body["no_price"], 30);
}

/// Scenario: a NO position only 25% underwater is held.
#[tokio::test]
async fn test_cut_losers_holds_shallow_losses() {
    let server = MockServer::start().await;
    let bot = live_bot(&server).await;

    Mock::given(method("GET"))
        .and(path("/trade-api/v2/portfolio/positions"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "market_positions": [
                {"ticker": "T1", "position": -5, "market_exposure": 400}
            ],
            "cursor": null
        })))
        .mount(&server)
        .await;

    Mock::given(method("GET"))
        .and(path("/trade-api/v2/markets/T1"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "market": {"ticker": "T1", "status": "active",
                        "yes_bid": 40, "yes_ask": 45, "no_bid": 55, "no_ask": 60}
        })))
        .mount(&server)
        .await;

    // Value 5 × 60 = 300; loss 25% < 42% → hold
    bot.cut_losers().await;

    let requests = server.received_requests().await.unwrap();
    assert!(requests
        .iter()
        .all(|r| r.url.path() != "/trade-api/v2/portfolio/orders"));
}

/// Scenario: unrealized profit reaching 10% of account value triggers the
/// profit rule, which locks in the winners through the paper ledger.
#[tokio::test]
async fn test_profit_rule_liquidates_paper_winners() {
    let server = MockServer::start().await;
    let mut config = Config::from_env().unwrap();
    config.trading_mode = TradingMode::Paper;
    let db = Database::open_in_memory().unwrap();
    let client = KalshiClient::new(&server.uri(), None, 5).unwrap();
    let weather =
        WeatherClient::with_base_urls("http://127.0.0.1:1".into(), "http://127.0.0.1:1".into())
            .unwrap();
    let mut bot = TradingBot::with_parts(config, db, client, weather);

    // Four NO fills on the same market: 40 contracts at 50¢, exposure 2,000¢
    let risk = Config::from_env().unwrap().risk;
    for _ in 0..4 {
        paper::open_trade(&bot.db, &no_signal("T1", 50, 50.0, SignalSource::Model), 10, &risk)
            .unwrap();
    }
    assert_eq!(paper::balance(&bot.db).unwrap(), 8_000);

    // YES collapsed to 5¢: the NO position is worth 40 × 95 = 3,800¢,
    // unrealized +1,800¢ against an 11,800¢ account (trigger 1,180¢)
    Mock::given(method("GET"))
        .and(path("/trade-api/v2/markets/T1"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "market": {"ticker": "T1", "status": "active",
                        "yes_bid": 5, "yes_ask": 10, "no_bid": 90, "no_ask": 10}
        })))
        .mount(&server)
        .await;

    let triggered = bot.check_profit_rule().await.unwrap();
    assert!(triggered);
    assert!(bot.profit_rule_triggered());

    // Winners closed: credit 40 × (100 − 5) = 3,800¢ → balance 11,800¢
    assert_eq!(paper::balance(&bot.db).unwrap(), 11_800);
    assert!(paper::positions(&bot.db).unwrap().is_empty());
}

/// Scenario: at 19:00 ET with KNYC's running high locked at 52.3°F, the
/// H>58 market bid at 30¢ yields a BUY NO at 70¢ with ~96.7% edge.
#[test]
fn test_lockin_impossible_bracket_scenario() {
    use weather_agent::kalshi::Market;

    assert!(lockin::is_high_locked(19));

    let market = Market {
        ticker: "KXHIGHNY-26FEB18-T58".to_string(),
        event_ticker: "KXHIGHNY-26FEB18".to_string(),
        status: "active".to_string(),
        yes_bid: 30,
        yes_ask: 35,
        no_bid: 65,
        no_ask: 70,
        strike_type: Some("greater".to_string()),
        floor_strike: Some(58.0),
        ..Default::default()
    };

    let signal = lockin::check_impossible(
        &market,
        "NYC",
        MarketType::High,
        "KXHIGHNY-26FEB18",
        52.3,
        15.0,
    )
    .expect("bracket above the locked high is impossible");

    assert_eq!(signal.action, Action::Buy);
    assert_eq!(signal.side, Side::No);
    assert_eq!(signal.suggested_price_cents, 70);
    assert!((signal.our_probability - 0.01).abs() < 1e-9);
    assert!((signal.edge_pct - 96.7).abs() < 0.1);
    assert_eq!(signal.signal_source, SignalSource::MetarLockin);
}

/// Scenario: live execution journals the trade and snapshots the book.
#[tokio::test]
async fn test_live_execution_journals_trade() {
    let server = MockServer::start().await;
    let bot = live_bot(&server).await;

    // No existing positions
    Mock::given(method("GET"))
        .and(path("/trade-api/v2/portfolio/positions"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "market_positions": [], "cursor": null
        })))
        .mount(&server)
        .await;

    Mock::given(method("GET"))
        .and(path("/trade-api/v2/portfolio/balance"))
        .respond_with(
            ResponseTemplate::new(200).set_body_json(serde_json::json!({"balance": 10000})),
        )
        .mount(&server)
        .await;

    Mock::given(method("GET"))
        .and(path("/trade-api/v2/markets/T1"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "market": {"ticker": "T1", "status": "active",
                        "yes_bid": 30, "yes_ask": 35, "no_bid": 65, "no_ask": 70}
        })))
        .mount(&server)
        .await;

    Mock::given(method("POST"))
        .and(path("/trade-api/v2/portfolio/orders"))
        .respond_with(ResponseTemplate::new(201).set_body_json(serde_json::json!({
            "order": {"order_id": "ord-live-1", "ticker": "T1", "side": "no",
                       "action": "buy", "status": "resting", "no_price": 70}
        })))
        .mount(&server)
        .await;

    let result = bot
        .execute_signal(&no_signal("T1", 30, 50.0, SignalSource::Model))
        .await
        .unwrap()
        .expect("live trade placed");
    assert!(!result.paper);
    assert_eq!(result.order_id.as_deref(), Some("ord-live-1"));

    // Journaled with inputs snapshot
    let unsettled = bot.db.unsettled_journal().unwrap();
    assert_eq!(unsettled.len(), 1);
    assert_eq!(unsettled[0].ticker, "T1");
    assert_eq!(unsettled[0].side, "no");
    assert_eq!(unsettled[0].entry_price_cents, 70);

    // Orderbook snapshot captured
    let snapshots: i64 = bot
        .db
        .conn
        .query_row("SELECT COUNT(*) FROM orderbook_snapshots", [], |r| r.get(0))
        .unwrap();
    assert_eq!(snapshots, 1);
}

/// Scenario: the paper mirror reproduces the dedup/stacking rules through
/// the full execution path.
#[tokio::test]
async fn test_paper_dedup_and_stacking_end_to_end() {
    let bot = paper_bot();

    // Model: first entry fills, duplicate is rejected
    let model = no_signal("T1", 30, 50.0, SignalSource::Model);
    assert!(bot.execute_signal(&model).await.unwrap().is_some());
    assert!(bot.execute_signal(&model).await.unwrap().is_none());

    // Lock-in: stacks up to the per-ticker cap
    let lockin_sig = no_signal("T2", 30, 90.0, SignalSource::MetarLockin);
    assert!(bot.execute_signal(&lockin_sig).await.unwrap().is_some());
    assert!(bot.execute_signal(&lockin_sig).await.unwrap().is_some());
    assert!(paper::contracts_on_ticker(&bot.db, "T2").unwrap() > 0);
}
