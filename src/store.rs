 use std::path::Path;
 use std::sync::Arc;

 use anyhow::{Context, Result};
 use chrono::{DateTime, Utc};
 use parking_lot::Mutex;
 use rusqlite::{params, Connection, OptionalExtension};

 use crate::model::{Coin, PriceSnapshot};

 /// Shared handle to the snapshot database. Clones share one connection;
 /// after `close` every clone reports the store as closed.
 #[derive(Clone)]
 pub struct SqliteStore {
     path: String,
     conn: Arc<Mutex<Option<Connection>>>,
 }

 impl SqliteStore {
     pub fn open(path: &str) -> Result<Self> {
         if path.trim().is_empty() {
             anyhow::bail!("SQLITE_PATH is empty");
         }
         let on_disk = path != ":memory:" && !path.starts_with("file:");
         if on_disk {
             if let Some(parent) = Path::new(path).parent() {
                 std::fs::create_dir_all(parent)
                     .with_context(|| format!("create sqlite parent dir for {path}"))?;
             }
         }

         // rusqlite::Connection is Send but not Sync; clones share it behind a mutex.
         let conn = Connection::open(path).with_context(|| format!("open sqlite {path}"))?;
         if on_disk {
             conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")?;
         }
         Ok(Self {
             path: path.to_string(),
             conn: Arc::new(Mutex::new(Some(conn))),
         })
     }

     pub fn path(&self) -> &str {
         &self.path
     }

     fn with_conn<T>(&self, f: impl FnOnce(&Connection) -> Result<T>) -> Result<T> {
         let guard = self.conn.lock();
         match guard.as_ref() {
             Some(conn) => f(conn),
             None => anyhow::bail!("sqlite store {} is closed", self.path),
         }
     }

     pub fn init_db(&self) -> Result<()> {
         self.with_conn(|conn| {
             conn.execute_batch(
                 r#"
 CREATE TABLE IF NOT EXISTS price_snapshots (
   id INTEGER PRIMARY KEY AUTOINCREMENT,
   coin_name TEXT NOT NULL,
   price_usd REAL NOT NULL,
   market_cap_usd REAL NOT NULL,
   change_24h REAL NOT NULL,
   captured_at_ms INTEGER NOT NULL
 );

 CREATE INDEX IF NOT EXISTS idx_price_snapshots_coin ON price_snapshots(coin_name, captured_at_ms);
 "#,
             )?;
             Ok(())
         })
     }

     pub fn insert_snapshot(&self, snap: &PriceSnapshot) -> Result<()> {
         self.with_conn(|conn| {
             conn.execute(
                 r#"
 INSERT INTO price_snapshots(coin_name, price_usd, market_cap_usd, change_24h, captured_at_ms)
 VALUES(?,?,?,?,?)
 "#,
                 params![
                     snap.coin.id(),
                     snap.price_usd,
                     snap.market_cap_usd,
                     snap.change_24h,
                     snap.captured_at.timestamp_millis()
                 ],
             )
             .with_context(|| format!("insert snapshot coin={}", snap.coin))?;
             Ok(())
         })
     }

     pub fn latest_snapshot(&self, coin: Coin) -> Result<Option<PriceSnapshot>> {
         let row = self.with_conn(|conn| {
             let row = conn
                 .query_row(
                     r#"
 SELECT price_usd, market_cap_usd, change_24h, captured_at_ms
 FROM price_snapshots
 WHERE coin_name = ?
 ORDER BY captured_at_ms DESC, id DESC
 LIMIT 1
 "#,
                     params![coin.id()],
                     |r| {
                         Ok((
                             r.get::<_, f64>(0)?,
                             r.get::<_, f64>(1)?,
                             r.get::<_, f64>(2)?,
                             r.get::<_, i64>(3)?,
                         ))
                     },
                 )
                 .optional()?;
             Ok(row)
         })?;

         let Some((price_usd, market_cap_usd, change_24h, ms)) = row else {
             return Ok(None);
         };
         let captured_at = DateTime::<Utc>::from_timestamp_millis(ms)
             .with_context(|| format!("bad captured_at_ms {ms} for {coin}"))?;
         Ok(Some(PriceSnapshot {
             coin,
             price_usd,
             market_cap_usd,
             change_24h,
             captured_at,
         }))
     }

     /// Prices for `coin`, newest first, at most `limit` of them.
     pub fn recent_prices(&self, coin: Coin, limit: usize) -> Result<Vec<f64>> {
         self.with_conn(|conn| {
             let mut stmt = conn.prepare(
                 r#"
 SELECT price_usd
 FROM price_snapshots
 WHERE coin_name = ?
 ORDER BY captured_at_ms DESC, id DESC
 LIMIT ?
 "#,
             )?;
             let mut rows = stmt.query(params![coin.id(), limit as i64])?;
             let mut out = vec![];
             while let Some(r) = rows.next()? {
                 out.push(r.get::<_, f64>(0)?);
             }
             Ok(out)
         })
     }

     /// Closes the connection for every clone of this handle. Closing twice is a no-op.
     pub fn close(&self) -> Result<()> {
         let Some(conn) = self.conn.lock().take() else {
             return Ok(());
         };
         conn.close()
             .map_err(|(_, e)| e)
             .with_context(|| format!("close sqlite {}", self.path))?;
         log::info!("store.closed path={}", self.path);
         Ok(())
     }
 }

 #[cfg(test)]
 mod tests {
     use super::*;
     use chrono::Duration;

     fn mem_store() -> SqliteStore {
         let store = SqliteStore::open(":memory:").unwrap();
         store.init_db().unwrap();
         store
     }

     fn snap(coin: Coin, price: f64, at: DateTime<Utc>) -> PriceSnapshot {
         PriceSnapshot {
             coin,
             price_usd: price,
             market_cap_usd: price * 1000.0,
             change_24h: -1.25,
             captured_at: at,
         }
     }

     #[test]
     fn latest_is_none_when_empty() {
         let store = mem_store();
         assert!(store.latest_snapshot(Coin::Bitcoin).unwrap().is_none());
         assert!(store.recent_prices(Coin::Bitcoin, 100).unwrap().is_empty());
     }

     #[test]
     fn latest_picks_newest_capture_for_coin() {
         let store = mem_store();
         let t0 = DateTime::<Utc>::from_timestamp_millis(1_700_000_000_000).unwrap();
         store.insert_snapshot(&snap(Coin::Bitcoin, 100.0, t0)).unwrap();
         store.insert_snapshot(&snap(Coin::Bitcoin, 110.0, t0 + Duration::hours(2))).unwrap();
         store.insert_snapshot(&snap(Coin::Ethereum, 5.0, t0 + Duration::hours(4))).unwrap();

         let latest = store.latest_snapshot(Coin::Bitcoin).unwrap().unwrap();
         assert_eq!(latest, snap(Coin::Bitcoin, 110.0, t0 + Duration::hours(2)));
         assert!(store.latest_snapshot(Coin::MaticNetwork).unwrap().is_none());
     }

     #[test]
     fn same_timestamp_falls_back_to_insert_order() {
         let store = mem_store();
         let t0 = DateTime::<Utc>::from_timestamp_millis(1_700_000_000_000).unwrap();
         store.insert_snapshot(&snap(Coin::Ethereum, 1.0, t0)).unwrap();
         store.insert_snapshot(&snap(Coin::Ethereum, 2.0, t0)).unwrap();
         assert_eq!(store.latest_snapshot(Coin::Ethereum).unwrap().unwrap().price_usd, 2.0);
     }

     #[test]
     fn recent_prices_are_newest_first_and_limited() {
         let store = mem_store();
         let t0 = DateTime::<Utc>::from_timestamp_millis(1_700_000_000_000).unwrap();
         for i in 0..5 {
             store
                 .insert_snapshot(&snap(Coin::MaticNetwork, i as f64, t0 + Duration::hours(i)))
                 .unwrap();
         }
         assert_eq!(store.recent_prices(Coin::MaticNetwork, 3).unwrap(), vec![4.0, 3.0, 2.0]);
         assert_eq!(store.recent_prices(Coin::MaticNetwork, 100).unwrap().len(), 5);
     }

     #[test]
     fn rows_survive_reopen_on_disk() {
         let dir = tempfile::tempdir().unwrap();
         let path = dir.path().join("nested").join("prices.sqlite");
         let path = path.to_str().unwrap();
         let t0 = DateTime::<Utc>::from_timestamp_millis(1_700_000_000_000).unwrap();

         let store = SqliteStore::open(path).unwrap();
         store.init_db().unwrap();
         store.insert_snapshot(&snap(Coin::Bitcoin, 42.0, t0)).unwrap();
         store.close().unwrap();

         let store = SqliteStore::open(path).unwrap();
         store.init_db().unwrap();
         assert_eq!(store.latest_snapshot(Coin::Bitcoin).unwrap().unwrap().price_usd, 42.0);
     }

     #[test]
     fn close_is_seen_by_every_clone() {
         let store = mem_store();
         let other = store.clone();
         store.close().unwrap();
         store.close().unwrap();
         assert!(other.latest_snapshot(Coin::Bitcoin).is_err());
         assert!(other.recent_prices(Coin::Bitcoin, 10).is_err());
     }

     #[test]
     fn queries_fail_without_schema() {
         let store = SqliteStore::open(":memory:").unwrap();
         assert!(store.latest_snapshot(Coin::Bitcoin).is_err());
     }
 }
