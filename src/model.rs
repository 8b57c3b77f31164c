use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Coin {
    Bitcoin,
    MaticNetwork,
    Ethereum,
}

/// Tracked coins and the identifier each one is queried, stored and served under.
/// Order here is the order upstream ids are requested and rows are written.
pub const COINS: [(Coin, &str); 3] = [
    (Coin::Bitcoin, "bitcoin"),
    (Coin::MaticNetwork, "matic-network"),
    (Coin::Ethereum, "ethereum"),
];

impl Coin {
    pub fn all() -> impl Iterator<Item = Coin> {
        COINS.iter().map(|(c, _)| *c)
    }

    pub fn id(self) -> &'static str {
        COINS
            .iter()
            .find(|(c, _)| *c == self)
            .map(|(_, id)| *id)
            .unwrap_or_default()
    }

    pub fn from_id(id: &str) -> Option<Coin> {
        COINS.iter().find(|(_, k)| *k == id).map(|(c, _)| *c)
    }
}

impl fmt::Display for Coin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.id())
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Quote {
    pub price_usd: f64,
    pub market_cap_usd: f64,
    pub change_24h: f64,
}

/// One quote per tracked coin.
pub type Quotes = BTreeMap<Coin, Quote>;

#[derive(Debug, Clone, PartialEq)]
pub struct PriceSnapshot {
    pub coin: Coin,
    pub price_usd: f64,
    pub market_cap_usd: f64,
    pub change_24h: f64,
    pub captured_at: DateTime<Utc>,
}

impl PriceSnapshot {
    pub fn from_quote(coin: Coin, quote: &Quote, captured_at: DateTime<Utc>) -> Self {
        Self {
            coin,
            price_usd: quote.price_usd,
            market_cap_usd: quote.market_cap_usd,
            change_24h: quote.change_24h,
            captured_at,
        }
    }
}
