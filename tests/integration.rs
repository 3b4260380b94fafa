//! Integration tests across the feed, filter, dispatcher and state modules.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use rust_decimal_macros::dec;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use wiremock::matchers::{method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

use stash_scanner::config::{
    AppConfig, ConfidenceLevel, CurrencyConfig, FeedConfig, FiltersConfig, MonitoringConfig,
    ScanMode, ScannerConfig,
};
use stash_scanner::currency::rates::{RateSnapshot, StaticRates};
use stash_scanner::currency::{CurrencySnapshot, CurrencyTable};
use stash_scanner::feed::{ChangeId, FeedDownloader, FeedPayload, NextResult};
use stash_scanner::filter::{
    compile_criteria, CompiledCriteria, CompiledFilter, Criteria, Filter, FilterDocument,
};
use stash_scanner::scanner::dispatcher::evaluate_payload;
use stash_scanner::scanner::results::ChannelResultHandler;
use stash_scanner::scanner::{ParserDispatcher, ScanContext, Scanner};
use stash_scanner::state::StateStore;

fn currency_config() -> CurrencyConfig {
    CurrencyConfig {
        rates_url: String::new(),
        update_interval_minutes: 30,
        confidence_level: ConfidenceLevel::Low,
    }
}

fn exalted_rates() -> Arc<StaticRates> {
    Arc::new(StaticRates::new(RateSnapshot {
        rates: [("Exalted Orb".to_string(), dec!(150))].into_iter().collect(),
        aliases: Vec::new(),
    }))
}

async fn currency() -> Arc<CurrencySnapshot> {
    let mut table = CurrencyTable::new(&currency_config(), None, exalted_rates());
    table.load().unwrap();
    table.update(true, false).await.unwrap();
    table.snapshot()
}

async fn compiled(id: &str, criteria: Criteria) -> Arc<CompiledFilter> {
    let currency = currency().await;
    let criteria = compile_criteria(&criteria, &CompiledCriteria::default(), &currency).unwrap();
    Arc::new(CompiledFilter::new(id, id, "user", true, criteria))
}

fn axe(id: &str, note: &str) -> serde_json::Value {
    serde_json::json!({
        "id": id,
        "name": "<<set:MS>><<set:M>><<set:S>>Doom Edge",
        "typeLine": "Vaal Axe",
        "league": "Standard",
        "note": note,
        "frameType": 2,
        "ilvl": 84,
        "identified": true,
        "x": 3,
        "y": 1
    })
}

fn page(next: &str, items: Vec<serde_json::Value>) -> serde_json::Value {
    serde_json::json!({
        "next_change_id": next,
        "stashes": [
            {"id": "tab-1", "public": true, "accountName": "seller",
             "lastCharacterName": "Trader", "stash": "shop", "items": items}
        ]
    })
}

fn payload(id: &str, next: &str, body: &serde_json::Value) -> FeedPayload {
    FeedPayload {
        change_id: ChangeId::new(id).unwrap(),
        next_change_id: ChangeId::new(next).unwrap(),
        body: Bytes::from(serde_json::to_vec(body).unwrap()),
    }
}

fn feed_config(base_url: String) -> FeedConfig {
    FeedConfig {
        base_url,
        connections: 2,
        request_delay_ms: 0,
        connect_timeout_seconds: 5,
        request_timeout_seconds: 60,
        skip_ahead: false,
        sufficient_delta: 100,
        skip_timeout_seconds: 120,
        queue_capacity: 4,
        latest_id_url: String::new(),
    }
}

/// Serve `body` for `id` and hold every request for `pending` open.
async fn mount_page(server: &MockServer, id: &str, body: &serde_json::Value, pending: &str) {
    Mock::given(method("GET"))
        .and(path("/feed"))
        .and(query_param("id", id))
        .respond_with(ResponseTemplate::new(200).set_body_json(body))
        .mount(server)
        .await;
    Mock::given(method("GET"))
        .and(path("/feed"))
        .and(query_param("id", pending))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(page("9-9-9-9-9", Vec::new()))
                .set_delay(Duration::from_secs(30)),
        )
        .mount(server)
        .await;
}

async fn new_dispatcher(dir: &Path, filters: Vec<Arc<CompiledFilter>>) -> (
    ParserDispatcher,
    tokio::sync::mpsc::UnboundedReceiver<stash_scanner::scanner::ItemMatch>,
) {
    let mut state = StateStore::new(dir.join("state"));
    state.load_state().unwrap();
    let ctx = Arc::new(ScanContext {
        filters,
        currency: currency().await,
        budget: None,
    });
    let (_tx, rx) = watch::channel(ctx);
    let (handler, matches) = ChannelResultHandler::new();
    let dispatcher = ParserDispatcher::new(
        "Standard",
        2,
        state,
        Arc::new(handler),
        rx,
        dir.join("errors"),
    )
    .unwrap();
    (dispatcher, matches)
}

// ──────────────────────────────────────────
// Feed downloader tests
// ──────────────────────────────────────────

#[tokio::test]
async fn downloader_releases_first_page_and_queues_next() {
    let server = MockServer::start().await;
    let first = page("1-1-1-1-2", Vec::new());
    mount_page(&server, "1-1-1-1-1", &first, "1-1-1-1-2").await;

    let stop = CancellationToken::new();
    let mut downloader = FeedDownloader::start(
        &feed_config(format!("{}/feed", server.uri())),
        ChangeId::new("1-1-1-1-1").unwrap(),
        false,
        &stop,
    )
    .unwrap();

    let NextResult::Payload(released) = downloader.next_result(Duration::from_secs(5)).await else {
        panic!("expected a payload");
    };
    assert_eq!(released.change_id.as_str(), "1-1-1-1-1");
    assert_eq!(released.next_change_id.as_str(), "1-1-1-1-2");
    assert_eq!(released.body, Bytes::from(serde_json::to_vec(&first).unwrap()));

    // the next page is still downloading, so nothing else is released
    assert!(matches!(
        downloader.next_result(Duration::from_millis(300)).await,
        NextResult::Timeout
    ));
    let mut pending = Vec::new();
    for _ in 0..20 {
        pending = downloader.stats().pending;
        if pending == ["1-1-1-1-2"] {
            break;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    assert_eq!(pending, vec!["1-1-1-1-2".to_string()]);

    downloader.stop();
    assert!(matches!(
        downloader.next_result(Duration::from_secs(5)).await,
        NextResult::Closed
    ));
    downloader.join().await;
}

#[tokio::test]
async fn downloader_retries_failed_page() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/feed"))
        .and(query_param("id", "1-1-1-1-1"))
        .respond_with(
            ResponseTemplate::new(500)
                .set_body_json(serde_json::json!({"error": {"code": 1, "message": "busy"}})),
        )
        .up_to_n_times(2)
        .mount(&server)
        .await;
    mount_page(&server, "1-1-1-1-1", &page("1-1-1-1-2", Vec::new()), "1-1-1-1-2").await;

    let stop = CancellationToken::new();
    let mut downloader = FeedDownloader::start(
        &feed_config(format!("{}/feed", server.uri())),
        ChangeId::new("1-1-1-1-1").unwrap(),
        false,
        &stop,
    )
    .unwrap();

    match downloader.next_result(Duration::from_secs(5)).await {
        NextResult::Payload(released) => assert_eq!(released.change_id.as_str(), "1-1-1-1-1"),
        other => panic!("expected a payload, got {other:?}"),
    }

    // stopping the scanner stops the downloader
    stop.cancel();
    downloader.join().await;
}

/// Page whose body is long enough for the next id to be read from its first
/// bytes, before the download completes.
fn long_page(next: &str) -> serde_json::Value {
    serde_json::json!({
        "next_change_id": next,
        "stashes": [
            {"id": "filler", "public": true, "accountName": "seller",
             "stash": "x".repeat(1024), "items": []}
        ]
    })
}

#[tokio::test]
async fn downloader_skips_ahead_until_caught_up() {
    // five large jumps, then steady single steps
    let mut ids = vec![0i64];
    for n in 0..30 {
        let step = if n < 5 { 1000 } else { 1 };
        ids.push(ids[n] + step);
    }
    let ids: Vec<String> = ids.iter().map(|v| format!("{v}-0-0-0-0")).collect();

    let server = MockServer::start().await;
    for pair in ids[..30].windows(2) {
        Mock::given(method("GET"))
            .and(path("/feed"))
            .and(query_param("id", pair[0].as_str()))
            .respond_with(ResponseTemplate::new(200).set_body_json(long_page(&pair[1])))
            .mount(&server)
            .await;
    }
    mount_page(&server, &ids[29], &long_page(&ids[30]), &ids[30]).await;

    let stop = CancellationToken::new();
    let mut downloader = FeedDownloader::start(
        &FeedConfig {
            skip_ahead: true,
            ..feed_config(format!("{}/feed", server.uri()))
        },
        ChangeId::new(&ids[0]).unwrap(),
        true,
        &stop,
    )
    .unwrap();

    let NextResult::Payload(first) = downloader.next_result(Duration::from_secs(10)).await else {
        panic!("expected a payload once caught up");
    };
    let position = ids.iter().position(|id| id == first.change_id.as_str()).unwrap();
    // the last ten released deltas must all be single steps first
    assert!(position >= 15, "released {} while still behind", first.change_id);
    assert_eq!(first.next_change_id.as_str(), ids[position + 1]);
    let mut skipping = true;
    for _ in 0..20 {
        skipping = downloader.stats().skip_ahead;
        if !skipping {
            break;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    assert!(!skipping);

    if position < 29 {
        let NextResult::Payload(second) = downloader.next_result(Duration::from_secs(5)).await else {
            panic!("expected the following page");
        };
        assert_eq!(second.change_id.as_str(), ids[position + 1]);
    }

    stop.cancel();
    downloader.join().await;
}

/// Page served by [`serve_feed`], optionally pausing after `stall_after`
/// bytes of the body.
struct StalledPage {
    body: Vec<u8>,
    stall_after: usize,
    stall: Duration,
}

/// Minimal HTTP/1.1 feed server. Unlike a mock server it can send part of a
/// body and hold the rest back. Unknown ids are never answered.
async fn serve_feed(pages: HashMap<String, StalledPage>) -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let pages = Arc::new(pages);
    tokio::spawn(async move {
        while let Ok((mut socket, _)) = listener.accept().await {
            let pages = pages.clone();
            tokio::spawn(async move {
                let mut request = Vec::new();
                let mut buf = [0u8; 1024];
                while !request.windows(4).any(|w| w == b"\r\n\r\n") {
                    let n = socket.read(&mut buf).await.unwrap_or(0);
                    if n == 0 {
                        return;
                    }
                    request.extend_from_slice(&buf[..n]);
                }
                let request = String::from_utf8_lossy(&request).to_string();
                let id = request
                    .split_once("id=")
                    .and_then(|(_, rest)| rest.split([' ', '&']).next())
                    .unwrap_or_default();
                let Some(page) = pages.get(id) else {
                    tokio::time::sleep(Duration::from_secs(30)).await;
                    return;
                };

                let head = format!(
                    "HTTP/1.1 200 OK\r\ncontent-type: application/json\r\ncontent-length: {}\r\nconnection: close\r\n\r\n",
                    page.body.len()
                );
                let (first, rest) = page.body.split_at(page.stall_after.min(page.body.len()));
                let _ = socket.write_all(head.as_bytes()).await;
                let _ = socket.write_all(first).await;
                let _ = socket.flush().await;
                tokio::time::sleep(page.stall).await;
                let _ = socket.write_all(rest).await;
                let _ = socket.shutdown().await;
            });
        }
    });
    format!("http://{addr}/feed")
}

#[tokio::test]
async fn downloader_releases_in_feed_order() {
    let first = serde_json::to_vec(&long_page("1-1-1-1-2")).unwrap();
    let second = serde_json::to_vec(&long_page("1-1-1-1-3")).unwrap();
    let pages = HashMap::from([
        (
            "1-1-1-1-1".to_string(),
            StalledPage {
                body: first.clone(),
                stall_after: 600,
                stall: Duration::from_millis(800),
            },
        ),
        (
            "1-1-1-1-2".to_string(),
            StalledPage {
                body: second.clone(),
                stall_after: second.len(),
                stall: Duration::ZERO,
            },
        ),
    ]);
    let base_url = serve_feed(pages).await;

    let stop = CancellationToken::new();
    let mut downloader = FeedDownloader::start(
        &feed_config(base_url),
        ChangeId::new("1-1-1-1-1").unwrap(),
        false,
        &stop,
    )
    .unwrap();

    // the second page completes while the first is still stalled
    assert!(matches!(
        downloader.next_result(Duration::from_millis(300)).await,
        NextResult::Timeout
    ));

    let NextResult::Payload(released) = downloader.next_result(Duration::from_secs(5)).await else {
        panic!("expected the first page");
    };
    assert_eq!(released.change_id.as_str(), "1-1-1-1-1");
    assert_eq!(released.body, Bytes::from(first));

    let NextResult::Payload(released) = downloader.next_result(Duration::from_secs(5)).await else {
        panic!("expected the second page");
    };
    assert_eq!(released.change_id.as_str(), "1-1-1-1-2");
    assert_eq!(released.body, Bytes::from(second));

    stop.cancel();
    downloader.join().await;
}

// ──────────────────────────────────────────
// Filter evaluation tests
// ──────────────────────────────────────────

#[tokio::test]
async fn price_max_in_exalted_splits_listings() {
    let filter = compiled(
        "cheap-axes",
        Criteria {
            base: Some("vaal axe".into()),
            price_max: Some("1 exalted".into()),
            ..Criteria::default()
        },
    )
    .await;
    let ctx = ScanContext {
        filters: vec![filter],
        currency: currency().await,
        budget: None,
    };

    let body = page(
        "1-1-1-1-2",
        vec![axe("at-100", "~b/o 100 chaos"), axe("at-200", "~b/o 200 chaos")],
    );
    let evaluation =
        evaluate_payload(&serde_json::to_vec(&body).unwrap(), "Standard", &ctx).unwrap();

    let ids: Vec<_> = evaluation.matches.iter().map(|m| m.item.id.as_str()).collect();
    assert_eq!(ids, vec!["at-100"]);
    assert_eq!(evaluation.items, 2);
}

#[tokio::test]
async fn filter_compiler_loads_user_filters() {
    let dir = tempfile::tempdir().unwrap();
    let user_file = dir.path().join("filters.json");
    FilterDocument {
        filters: vec![
            Filter::new(
                "Cheap axes",
                "axes",
                Criteria {
                    base: Some("vaal axe".into()),
                    price_max: Some("1 exalted".into()),
                    ..Criteria::default()
                },
            ),
            {
                let mut child = Filter::new(
                    "Bargain axes",
                    "bargain",
                    Criteria {
                        price_max: Some("* 0.5".into()),
                        ..Criteria::default()
                    },
                );
                child.baseid = "axes".into();
                child
            },
        ],
        last_update: None,
    }
    .save(&user_file)
    .unwrap();

    let mut compiler = stash_scanner::filter::FilterCompiler::new(
        &FiltersConfig {
            user_file,
            config_file: dir.path().join("filter_config.json"),
            item_prices_urls: Vec::new(),
            update_interval_minutes: 10,
        },
        dir.path().join("auto.json"),
        None,
    );
    compiler.load().unwrap();
    let summary = compiler.compile_all(&*currency().await);
    assert_eq!(summary.active, 2);
    assert_eq!(summary.failed, 0);

    let active = compiler.active();
    let bargain = active.iter().find(|f| f.id == "bargain").unwrap();
    assert_eq!(bargain.price_max(), Some(dec!(75)));
}

// ──────────────────────────────────────────
// Dispatcher and state tests
// ──────────────────────────────────────────

#[tokio::test]
async fn dispatcher_reports_and_commits_payload() {
    let dir = tempfile::tempdir().unwrap();
    let axes = compiled("axes", Criteria { base: Some("vaal axe".into()), ..Criteria::default() }).await;
    let (mut dispatcher, mut matches) = new_dispatcher(dir.path(), vec![axes]).await;

    let body = page("1-1-1-1-2", vec![axe("a", "~b/o 1 exa"), axe("b", "~price 3 chaos")]);
    let stats = dispatcher.process(&payload("1-1-1-1-1", "1-1-1-1-2", &body)).await.unwrap();
    assert_eq!(stats.league_tabs, 1);
    assert_eq!(stats.accepted, 2);

    let first = matches.try_recv().unwrap();
    assert_eq!(first.filter_id, "axes");
    assert_eq!(first.stash.account_name, "seller");
    assert!(first.whisper_message().starts_with("@Trader Hi, I would like to buy your"));

    let mut state = dispatcher.into_state();
    state.close().unwrap();

    let mut reloaded = StateStore::new(dir.path().join("state"));
    reloaded.load_state().unwrap();
    assert_eq!(reloaded.change_id().map(|c| c.as_str()), Some("1-1-1-1-2"));
    assert_eq!(reloaded.len(), 2);
}

#[tokio::test]
async fn crash_before_commit_reprocesses_payload_once() {
    let dir = tempfile::tempdir().unwrap();
    let state_dir: PathBuf = dir.path().join("state");
    let axes = compiled("axes", Criteria { base: Some("vaal axe".into()), ..Criteria::default() }).await;

    // P0 is fully committed
    let p0 = page("1-1-1-1-2", vec![axe("same", "~b/o 5 chaos"), axe("repriced", "~b/o 5 chaos")]);
    {
        let (mut dispatcher, mut matches) = new_dispatcher(dir.path(), vec![axes.clone()]).await;
        dispatcher.process(&payload("1-1-1-1-1", "1-1-1-1-2", &p0)).await.unwrap();
        assert!(matches.try_recv().is_ok());
        assert!(matches.try_recv().is_ok());
        dispatcher.into_state().close().unwrap();
    }

    // P is recorded but the process dies before its cursor is saved
    let p = page(
        "1-1-1-1-3",
        vec![
            axe("same", "~b/o 5 chaos"),
            axe("repriced", "~b/o 4 chaos"),
            axe("fresh", "~b/o 9 chaos"),
        ],
    );
    {
        let mut state = StateStore::new(&state_dir);
        state.load_state().unwrap();
        assert!(!state.add_item("same", Some("~b/o 5 chaos"), "seller"));
        assert!(state.add_item("repriced", Some("~b/o 4 chaos"), "seller"));
        assert!(state.add_item("fresh", Some("~b/o 9 chaos"), "seller"));
        drop(state);
    }

    let (mut dispatcher, mut matches) = new_dispatcher(dir.path(), vec![axes]).await;
    assert_eq!(dispatcher.state().change_id().map(|c| c.as_str()), Some("1-1-1-1-2"));

    let stats = dispatcher.process(&payload("1-1-1-1-2", "1-1-1-1-3", &p)).await.unwrap();
    assert_eq!(stats.matches, 3);
    assert_eq!(stats.accepted, 2);

    let mut reported = vec![
        matches.try_recv().unwrap().item.id,
        matches.try_recv().unwrap().item.id,
    ];
    reported.sort();
    assert_eq!(reported, vec!["fresh".to_string(), "repriced".to_string()]);
    assert!(matches.try_recv().is_err());
    assert_eq!(dispatcher.state().change_id().map(|c| c.as_str()), Some("1-1-1-1-3"));
}

// ──────────────────────────────────────────
// Scanner lifecycle tests
// ──────────────────────────────────────────

fn scanner_config(data_dir: &Path, server: &MockServer) -> AppConfig {
    let mut feed = feed_config(format!("{}/feed", server.uri()));
    feed.latest_id_url = format!("{}/stats", server.uri());
    AppConfig {
        scanner: ScannerConfig {
            league: "Standard".to_string(),
            mode: ScanMode::Latest,
            workers: 1,
            data_dir: data_dir.to_path_buf(),
            status_interval_seconds: 60,
        },
        feed,
        currency: currency_config(),
        filters: FiltersConfig {
            user_file: data_dir.join("filters.json"),
            config_file: data_dir.join("filter_config.json"),
            item_prices_urls: Vec::new(),
            update_interval_minutes: 10,
        },
        monitoring: MonitoringConfig {
            log_level: "info".to_string(),
            health_addr: String::new(),
            webhook_enabled: false,
        },
    }
}

#[tokio::test]
async fn scanner_runs_from_latest_until_stopped() {
    let dir = tempfile::tempdir().unwrap();
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/stats"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(serde_json::json!({"next_change_id": "1-1-1-1-1"})),
        )
        .mount(&server)
        .await;
    let first = page("1-1-1-1-2", vec![axe("listed", "~b/o 1 exa")]);
    mount_page(&server, "1-1-1-1-1", &first, "1-1-1-1-2").await;

    FilterDocument {
        filters: vec![Filter::new(
            "Axes",
            "axes",
            Criteria { base: Some("vaal axe".into()), ..Criteria::default() },
        )],
        last_update: None,
    }
    .save(&dir.path().join("filters.json"))
    .unwrap();

    let (handler, mut matches) = ChannelResultHandler::new();
    let scanner = Scanner::new(
        scanner_config(dir.path(), &server),
        exalted_rates(),
        None,
        Arc::new(handler),
    )
    .unwrap()
    .with_update_tick(Duration::from_millis(100));

    let stop = CancellationToken::new();
    let run = tokio::spawn(scanner.run(stop.clone()));

    let found = tokio::time::timeout(Duration::from_secs(10), matches.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(found.item.id, "listed");
    assert_eq!(found.filter_id, "axes");

    stop.cancel();
    tokio::time::timeout(Duration::from_secs(5), run)
        .await
        .unwrap()
        .unwrap()
        .unwrap();

    let mut state = StateStore::new(dir.path().join("state"));
    state.load_state().unwrap();
    assert_eq!(state.change_id().map(|c| c.as_str()), Some("1-1-1-1-2"));
    assert!(state.get("listed").is_some());
}
