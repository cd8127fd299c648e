// =============================================================================
// Position book — the executor's view of its own open positions
// =============================================================================
//
// A single owner of the symbol -> position map. Requests for the same symbol
// are serialised through a hash-bucket of async locks, while unrelated
// symbols proceed in parallel. The book also tracks the equity numbers the
// prop-firm gates read: the day's starting equity and the session's peak
// equity watermark.

use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};

use chrono::Utc;
use parking_lot::Mutex;
use serde::Serialize;

use crate::types::{Action, Symbol};

const LOCK_BUCKETS: usize = 16;

/// One open position held by this executor.
#[derive(Debug, Clone, Serialize)]
pub struct Position {
    pub symbol: Symbol,
    pub action: Action,
    pub quantity: f64,
    pub entry_price: f64,
    pub opened_at: i64,
    pub order_id: String,
}

struct DailyEquity {
    /// UTC date this record covers, `YYYY-MM-DD`.
    date: String,
    day_start_equity: f64,
    peak_equity: f64,
}

pub struct PositionBook {
    positions: Mutex<HashMap<Symbol, Position>>,
    daily: Mutex<DailyEquity>,
    locks: Vec<tokio::sync::Mutex<()>>,
}

impl PositionBook {
    pub fn new(starting_equity: f64) -> Self {
        Self {
            positions: Mutex::new(HashMap::new()),
            daily: Mutex::new(DailyEquity {
                date: Utc::now().format("%Y-%m-%d").to_string(),
                day_start_equity: starting_equity,
                peak_equity: starting_equity,
            }),
            locks: (0..LOCK_BUCKETS)
                .map(|_| tokio::sync::Mutex::new(()))
                .collect(),
        }
    }

    /// Serialise request handling for one symbol. Unrelated symbols usually
    /// land in different buckets and proceed concurrently.
    pub async fn lock_symbol(&self, symbol: &Symbol) -> tokio::sync::MutexGuard<'_, ()> {
        let mut hasher = DefaultHasher::new();
        symbol.as_str().hash(&mut hasher);
        let bucket = (hasher.finish() as usize) % LOCK_BUCKETS;
        self.locks[bucket].lock().await
    }

    pub fn open_count(&self) -> usize {
        self.positions.lock().len()
    }

    /// A position on this symbol in the given direction already exists.
    pub fn has_same_direction(&self, symbol: &Symbol, action: Action) -> bool {
        self.positions
            .lock()
            .get(symbol)
            .is_some_and(|p| p.action == action)
    }

    pub fn has_position(&self, symbol: &Symbol) -> bool {
        self.positions.lock().contains_key(symbol)
    }

    pub fn open(&self, position: Position) {
        self.positions.lock().insert(position.symbol.clone(), position);
    }

    pub fn close(&self, symbol: &Symbol) -> Option<Position> {
        self.positions.lock().remove(symbol)
    }

    pub fn open_positions(&self) -> Vec<Position> {
        self.positions.lock().values().cloned().collect()
    }

    // -------------------------------------------------------------------------
    // Equity tracking for the prop-firm gates
    // -------------------------------------------------------------------------

    /// Observe the latest account equity. Rolls the daily baseline over at
    /// the UTC day boundary and advances the session peak watermark. Returns
    /// `(loss_today_pct, drawdown_pct)`.
    pub fn observe_equity(&self, equity: f64) -> (f64, f64) {
        let today = Utc::now().format("%Y-%m-%d").to_string();
        let mut daily = self.daily.lock();

        if daily.date != today {
            daily.date = today;
            daily.day_start_equity = equity;
        }
        if equity > daily.peak_equity {
            daily.peak_equity = equity;
        }

        let loss_today_pct = if daily.day_start_equity > 0.0 {
            ((daily.day_start_equity - equity) / daily.day_start_equity * 100.0).max(0.0)
        } else {
            0.0
        };
        let drawdown_pct = if daily.peak_equity > 0.0 {
            ((daily.peak_equity - equity) / daily.peak_equity * 100.0).max(0.0)
        } else {
            0.0
        };

        (loss_today_pct, drawdown_pct)
    }

    /// The UTC date of the current daily window, for gate-trip bookkeeping.
    pub fn current_date(&self) -> String {
        self.daily.lock().date.clone()
    }
}
