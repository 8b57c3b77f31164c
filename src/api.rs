use std::future::Future;
use std::net::SocketAddr;
use std::time::Duration;

use anyhow::{Context, Result};
use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::{IntoResponse, Json, Response},
    routing::get,
    Router,
};
use serde::{Deserialize, Serialize};
use tower_http::cors::CorsLayer;

use crate::{config::Settings, model::Coin, stats::standard_deviation, store::SqliteStore};

const INVALID_COIN: &str =
    "Invalid or missing coin parameter. Must be one of bitcoin, ethereum, or matic-network.";
const SERVER_ERROR: &str = "Server error. Please try again later.";

#[derive(Clone)]
pub struct ApiState {
    pub store: SqliteStore,
    pub query_timeout: Duration,
    pub deviation_window: usize,
}

impl ApiState {
    pub fn new(settings: &Settings, store: SqliteStore) -> Self {
        Self {
            store,
            query_timeout: settings.query_timeout(),
            deviation_window: settings.deviation_window,
        }
    }
}

pub fn router(state: ApiState) -> Router {
    Router::new()
        .route("/", get(index))
        .route("/stats", get(stats))
        .route("/deviation", get(deviation))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

pub async fn serve(
    settings: &Settings,
    store: SqliteStore,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> Result<()> {
    let app = router(ApiState::new(settings, store));

    let addr: SocketAddr = format!("{}:{}", settings.api_host, settings.api_port)
        .parse()
        .with_context(|| format!("api addr {}:{}", settings.api_host, settings.api_port))?;

    log::info!("api.start url=http://{}", addr);
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("bind {addr}"))?;
    axum::serve(listener, app).with_graceful_shutdown(shutdown).await?;
    log::info!("api.stopped");
    Ok(())
}

#[derive(Deserialize)]
struct CoinQ {
    coin: Option<String>,
}

#[derive(Debug, Serialize, Deserialize, PartialEq)]
struct StatsBody {
    price: f64,
    #[serde(rename = "marketCap")]
    market_cap: f64,
    #[serde(rename = "24hChange")]
    change_24h: f64,
}

#[derive(Debug, Serialize, Deserialize, PartialEq)]
struct DeviationBody {
    deviation: String,
}

enum QueryError {
    Store(anyhow::Error),
    Timeout,
}

fn error_json(status: StatusCode, msg: &str) -> Response {
    (status, Json(serde_json::json!({ "error": msg }))).into_response()
}

fn parse_coin(q: &CoinQ) -> Option<Coin> {
    q.coin.as_deref().and_then(Coin::from_id)
}

/// Runs a store read off the async workers, bounded by the request timeout.
async fn with_store<T, F>(st: &ApiState, f: F) -> Result<T, QueryError>
where
    T: Send + 'static,
    F: FnOnce(&SqliteStore) -> Result<T> + Send + 'static,
{
    let store = st.store.clone();
    let task = tokio::task::spawn_blocking(move || f(&store));
    match tokio::time::timeout(st.query_timeout, task).await {
        Err(_) => Err(QueryError::Timeout),
        Ok(Err(join)) => Err(QueryError::Store(join.into())),
        Ok(Ok(res)) => res.map_err(QueryError::Store),
    }
}

fn server_error(route: &str, coin: Coin, e: QueryError) -> Response {
    match e {
        QueryError::Store(e) => log::error!("api.{}.error coin={} err={:#}", route, coin, e),
        QueryError::Timeout => log::error!("api.{}.timeout coin={}", route, coin),
    }
    error_json(StatusCode::INTERNAL_SERVER_ERROR, SERVER_ERROR)
}

async fn index() -> impl IntoResponse {
    "Crypto price tracker"
}

async fn stats(State(st): State<ApiState>, Query(q): Query<CoinQ>) -> Response {
    let Some(coin) = parse_coin(&q) else {
        return error_json(StatusCode::BAD_REQUEST, INVALID_COIN);
    };

    match with_store(&st, move |s| s.latest_snapshot(coin)).await {
        Ok(Some(snap)) => Json(StatsBody {
            price: snap.price_usd,
            market_cap: snap.market_cap_usd,
            change_24h: snap.change_24h,
        })
        .into_response(),
        Ok(None) => error_json(StatusCode::NOT_FOUND, &format!("No data found for {coin}")),
        Err(e) => server_error("stats", coin, e),
    }
}

async fn deviation(State(st): State<ApiState>, Query(q): Query<CoinQ>) -> Response {
    let Some(coin) = parse_coin(&q) else {
        return error_json(StatusCode::BAD_REQUEST, INVALID_COIN);
    };

    let window = st.deviation_window;
    match with_store(&st, move |s| s.recent_prices(coin, window)).await {
        Ok(prices) if prices.is_empty() => {
            error_json(StatusCode::NOT_FOUND, &format!("No data found for {coin}"))
        }
        Ok(prices) => Json(DeviationBody {
            deviation: format!("{:.2}", standard_deviation(&prices)),
        })
        .into_response(),
        Err(e) => server_error("deviation", coin, e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::PriceSnapshot;
    use axum::body::{to_bytes, Body};
    use axum::http::Request;
    use chrono::{DateTime, Utc};
    use tower::ServiceExt;

    fn mem_store() -> SqliteStore {
        let store = SqliteStore::open(":memory:").unwrap();
        store.init_db().unwrap();
        store
    }

    fn app(store: SqliteStore) -> Router {
        router(ApiState::new(&Settings::default(), store))
    }

    async fn get(app: Router, uri: &str) -> (StatusCode, Vec<u8>) {
        let resp = app
            .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = resp.status();
        let body = to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        (status, body.to_vec())
    }

    fn insert(store: &SqliteStore, coin: Coin, price: f64, ms: i64) {
        store
            .insert_snapshot(&PriceSnapshot {
                coin,
                price_usd: price,
                market_cap_usd: price * 10.0,
                change_24h: 0.5,
                captured_at: DateTime::<Utc>::from_timestamp_millis(ms).unwrap(),
            })
            .unwrap();
    }

    #[tokio::test]
    async fn index_acknowledges() {
        let (status, body) = get(app(mem_store()), "/").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, b"Crypto price tracker");
    }

    #[tokio::test]
    async fn unknown_coin_is_bad_request_even_with_data() {
        let store = mem_store();
        insert(&store, Coin::Bitcoin, 1.0, 1_000);
        for uri in [
            "/stats?coin=dogecoin",
            "/deviation?coin=dogecoin",
            "/stats",
            "/deviation?coin=",
            "/stats?coin=%20bitcoin",
        ] {
            let (status, body) = get(app(store.clone()), uri).await;
            assert_eq!(status, StatusCode::BAD_REQUEST, "{uri}");
            let v: serde_json::Value = serde_json::from_slice(&body).unwrap();
            assert_eq!(v["error"], INVALID_COIN);
        }
    }

    #[tokio::test]
    async fn valid_coin_with_empty_store_is_not_found() {
        for uri in ["/stats?coin=bitcoin", "/deviation?coin=matic-network"] {
            let (status, body) = get(app(mem_store()), uri).await;
            assert_eq!(status, StatusCode::NOT_FOUND, "{uri}");
            let v: serde_json::Value = serde_json::from_slice(&body).unwrap();
            assert!(v["error"].as_str().unwrap().starts_with("No data found for"));
        }
    }

    #[tokio::test]
    async fn stats_returns_latest_snapshot() {
        let store = mem_store();
        insert(&store, Coin::Ethereum, 3000.0, 1_000);
        insert(&store, Coin::Ethereum, 3100.0, 2_000);
        insert(&store, Coin::Bitcoin, 60000.0, 3_000);

        let (status, body) = get(app(store), "/stats?coin=ethereum").await;
        assert_eq!(status, StatusCode::OK);
        let v: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(v, serde_json::json!({ "price": 3100.0, "marketCap": 31000.0, "24hChange": 0.5 }));
    }

    #[tokio::test]
    async fn deviation_is_two_decimal_string() {
        let store = mem_store();
        for (i, p) in [1.0, 2.0, 3.0, 4.0, 5.0].into_iter().enumerate() {
            insert(&store, Coin::MaticNetwork, p, i as i64);
        }
        let (status, body) = get(app(store), "/deviation?coin=matic-network").await;
        assert_eq!(status, StatusCode::OK);
        let v: DeviationBody = serde_json::from_slice(&body).unwrap();
        assert_eq!(v.deviation, "1.41");
    }

    #[tokio::test]
    async fn deviation_uses_only_newest_window() {
        let store = mem_store();
        // 50 old outliers then 100 flat readings
        for i in 0..50 {
            insert(&store, Coin::Bitcoin, 1_000_000.0, i);
        }
        for i in 50..150 {
            insert(&store, Coin::Bitcoin, 42.0, i);
        }
        let (_, body) = get(app(store), "/deviation?coin=bitcoin").await;
        let v: DeviationBody = serde_json::from_slice(&body).unwrap();
        assert_eq!(v.deviation, "0.00");
    }

    #[tokio::test]
    async fn store_failure_is_server_error() {
        let store = SqliteStore::open(":memory:").unwrap();
        for uri in ["/stats?coin=bitcoin", "/deviation?coin=bitcoin"] {
            let (status, body) = get(app(store.clone()), uri).await;
            assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR, "{uri}");
            let v: serde_json::Value = serde_json::from_slice(&body).unwrap();
            assert_eq!(v["error"], SERVER_ERROR);
        }
    }
}
