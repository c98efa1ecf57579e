#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]

use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};

use agora_orders_core::{
    from_unix_seconds, notification_due, now_utc, Contract, DisputeCaseRecord, DisputeResolution,
    OrderState, Outpoint, PaymentAddress, PurchaseRecord, TransactionRecord, NOTICE_WINDOW,
};
use r2d2::Pool;
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::{params, params_from_iter, types::Value, Connection, OptionalExtension};
use serde::Serialize;
use thiserror::Error;
use time::OffsetDateTime;

const ORDERS_MIGRATION_VERSION: i64 = 1;
const DEFAULT_READ_POOL_SIZE: u32 = 4;

const SCHEMA_ORDERS_V1: &str = r"
CREATE TABLE IF NOT EXISTS schema_migrations (
  version INTEGER PRIMARY KEY,
  applied_at INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS purchases (
  orderID TEXT PRIMARY KEY NOT NULL,
  contract TEXT,
  state INTEGER NOT NULL DEFAULT 0,
  read INTEGER NOT NULL DEFAULT 0 CHECK (read IN (0, 1)),
  timestamp INTEGER NOT NULL DEFAULT 0,
  total INTEGER NOT NULL DEFAULT 0,
  thumbnail TEXT NOT NULL DEFAULT '',
  vendorID TEXT NOT NULL DEFAULT '',
  vendorHandle TEXT NOT NULL DEFAULT '',
  title TEXT NOT NULL DEFAULT '',
  shippingName TEXT NOT NULL DEFAULT '',
  shippingAddress TEXT NOT NULL DEFAULT '',
  paymentAddr TEXT NOT NULL DEFAULT '',
  funded INTEGER CHECK (funded IN (0, 1) OR funded IS NULL),
  transactions TEXT,
  lastNotifiedAt INTEGER NOT NULL DEFAULT 0 CHECK (lastNotifiedAt >= 0)
);

CREATE INDEX IF NOT EXISTS idx_purchases_state ON purchases(state);
CREATE INDEX IF NOT EXISTS idx_purchases_timestamp ON purchases(timestamp);
CREATE INDEX IF NOT EXISTS idx_purchases_paymentAddr ON purchases(paymentAddr);
CREATE INDEX IF NOT EXISTS idx_purchases_lastNotifiedAt ON purchases(lastNotifiedAt);

CREATE TABLE IF NOT EXISTS cases (
  caseID TEXT PRIMARY KEY NOT NULL,
  buyerContract BLOB,
  vendorContract BLOB,
  buyerValidationErrors TEXT,
  vendorValidationErrors TEXT,
  buyerPayoutAddress TEXT,
  vendorPayoutAddress TEXT,
  buyerOutpoints TEXT,
  vendorOutpoints TEXT,
  state INTEGER NOT NULL DEFAULT 0,
  read INTEGER NOT NULL DEFAULT 0 CHECK (read IN (0, 1)),
  buyerOpened INTEGER NOT NULL DEFAULT 0 CHECK (buyerOpened IN (0, 1)),
  claim TEXT NOT NULL DEFAULT '',
  timestamp INTEGER NOT NULL DEFAULT 0,
  resolution BLOB,
  lastNotifiedAt INTEGER NOT NULL DEFAULT 0 CHECK (lastNotifiedAt >= 0)
);

CREATE INDEX IF NOT EXISTS idx_cases_state ON cases(state);
CREATE INDEX IF NOT EXISTS idx_cases_timestamp ON cases(timestamp);
CREATE INDEX IF NOT EXISTS idx_cases_lastNotifiedAt ON cases(lastNotifiedAt);
";

/// Order states in which a dispute-timeout reminder still makes sense.
const DISPUTE_NOTICE_STATES: [OrderState; 3] = [
    OrderState::Pending,
    OrderState::AwaitingFulfillment,
    OrderState::Fulfilled,
];

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("record not found: {0}")]
    NotFound(String),
    #[error("storage failure: {0}")]
    Storage(#[from] rusqlite::Error),
    #[error("read pool failure: {0}")]
    Pool(#[from] r2d2::Error),
    #[error("serialization failure: {0}")]
    Serialization(String),
    #[error("write lock poisoned")]
    LockPoisoned,
}

/// One page of listing results plus the pre-limit size of the filtered set.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Page<T> {
    pub items: Vec<T>,
    pub total: usize,
}

/// Shared handle to the order database: one write connection guarded by a
/// process-wide mutex (the engine allows a single in-flight writer) and a
/// pool of read connections that never touch that lock.
#[derive(Clone)]
pub struct Datastore {
    write_conn: Arc<Mutex<Connection>>,
    read_pool: Pool<SqliteConnectionManager>,
}

impl Datastore {
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        Self::with_pool_size(path, DEFAULT_READ_POOL_SIZE)
    }

    pub fn with_pool_size(path: &Path, pool_size: u32) -> Result<Self, StoreError> {
        let conn = Connection::open(path)?;
        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA foreign_keys = ON;
             PRAGMA busy_timeout = 5000;",
        )?;

        let manager = SqliteConnectionManager::file(path)
            .with_init(|conn| conn.execute_batch("PRAGMA busy_timeout = 5000;"));
        let read_pool = Pool::builder().max_size(pool_size).build(manager)?;

        Ok(Self {
            write_conn: Arc::new(Mutex::new(conn)),
            read_pool,
        })
    }

    /// Applies the idempotent schema and registers the migration version.
    pub fn migrate(&self) -> Result<(), StoreError> {
        let conn = lock_writer(&self.write_conn)?;
        conn.execute_batch(SCHEMA_ORDERS_V1)?;
        conn.execute(
            "INSERT OR IGNORE INTO schema_migrations(version, applied_at) VALUES (?1, ?2)",
            params![ORDERS_MIGRATION_VERSION, now_utc().unix_timestamp()],
        )?;
        Ok(())
    }

    /// Purchase store bound to this database. Every store created from the
    /// same `Datastore` shares one write lock.
    #[must_use]
    pub fn purchases(&self) -> PurchaseStore {
        PurchaseStore {
            write_conn: Arc::clone(&self.write_conn),
            read_pool: self.read_pool.clone(),
        }
    }

    /// Dispute case store bound to this database.
    #[must_use]
    pub fn cases(&self) -> CaseStore {
        CaseStore {
            write_conn: Arc::clone(&self.write_conn),
            read_pool: self.read_pool.clone(),
        }
    }
}

fn lock_writer(conn: &Arc<Mutex<Connection>>) -> Result<MutexGuard<'_, Connection>, StoreError> {
    conn.lock().map_err(|_| StoreError::LockPoisoned)
}

/// A fully decoded purchase row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PurchaseDetails {
    pub contract: Contract,
    pub state: OrderState,
    pub funded: bool,
    pub records: Vec<TransactionRecord>,
    pub read: bool,
}

/// Denormalized purchase summary for UI listings. All display fields were
/// materialized at write time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PurchaseListing {
    pub order_id: String,
    pub timestamp: OffsetDateTime,
    pub total: u64,
    pub title: String,
    pub thumbnail: String,
    pub vendor_id: String,
    pub vendor_handle: String,
    pub shipping_name: String,
    pub shipping_address: String,
    pub state: OrderState,
    pub read: bool,
}

#[derive(Clone)]
pub struct PurchaseStore {
    write_conn: Arc<Mutex<Connection>>,
    read_pool: Pool<SqliteConnectionManager>,
}

impl PurchaseStore {
    /// Inserts or replaces the purchase row for `order_id`. Display and
    /// search fields are derived from the contract here, once, so listing
    /// queries never recompute them. Funding state, transaction records and
    /// the notification timestamp already stored for this key survive the
    /// replace.
    pub fn put(
        &self,
        order_id: &str,
        contract: &Contract,
        state: OrderState,
        read: bool,
    ) -> Result<(), StoreError> {
        let contract_text = encode_contract_text(contract)?;
        let total = i64::try_from(contract.order_total()).map_err(|_| {
            StoreError::Serialization(format!(
                "order total out of range: {}",
                contract.order_total()
            ))
        })?;

        let conn = lock_writer(&self.write_conn)?;
        conn.execute(
            "INSERT OR REPLACE INTO purchases(
                orderID, contract, state, read, timestamp, total, thumbnail,
                vendorID, vendorHandle, title, shippingName, shippingAddress,
                paymentAddr, funded, transactions, lastNotifiedAt
             ) VALUES (
                ?1, ?2, ?3, ?4, ?5, ?6, ?7,
                ?8, ?9, ?10, ?11, ?12,
                ?13,
                (SELECT funded FROM purchases WHERE orderID = ?1),
                (SELECT transactions FROM purchases WHERE orderID = ?1),
                COALESCE((SELECT lastNotifiedAt FROM purchases WHERE orderID = ?1), 0)
             )",
            params![
                order_id,
                contract_text,
                state.to_int(),
                i64::from(read),
                contract.order_timestamp(),
                total,
                contract.thumbnail(),
                contract.vendor_peer_id(),
                contract.vendor_handle(),
                contract.title(),
                contract.shipping_name(),
                contract.shipping_address(),
                contract.payment_address(),
            ],
        )?;
        Ok(())
    }

    pub fn get_by_order_id(&self, order_id: &str) -> Result<PurchaseDetails, StoreError> {
        let conn = self.read_pool.get()?;
        let mut stmt = conn.prepare(
            "SELECT contract, state, funded, transactions, read
             FROM purchases
             WHERE orderID = ?1",
        )?;
        let row = stmt
            .query_row(params![order_id], |row| {
                Ok((
                    row.get::<_, Option<String>>(0)?,
                    row.get::<_, i64>(1)?,
                    row.get::<_, Option<i64>>(2)?,
                    row.get::<_, Option<String>>(3)?,
                    row.get::<_, i64>(4)?,
                ))
            })
            .optional()?;

        let Some(raw) = row else {
            return Err(StoreError::NotFound(order_id.to_string()));
        };
        decode_purchase_details(raw)
    }

    /// Secondary lookup by the payment address stored at `put` time. The
    /// caller is responsible for handing over the same canonical encoding
    /// the wallet produced when the order was written.
    pub fn get_by_payment_address(
        &self,
        address: &PaymentAddress,
    ) -> Result<PurchaseDetails, StoreError> {
        let conn = self.read_pool.get()?;
        let mut stmt = conn.prepare(
            "SELECT contract, state, funded, transactions, read
             FROM purchases
             WHERE paymentAddr = ?1",
        )?;
        let row = stmt
            .query_row(params![address.as_str()], |row| {
                Ok((
                    row.get::<_, Option<String>>(0)?,
                    row.get::<_, i64>(1)?,
                    row.get::<_, Option<i64>>(2)?,
                    row.get::<_, Option<String>>(3)?,
                    row.get::<_, i64>(4)?,
                ))
            })
            .optional()?;

        let Some(raw) = row else {
            return Err(StoreError::NotFound(address.to_string()));
        };
        decode_purchase_details(raw)
    }

    /// Removes the row if it exists. Idempotent; callers needing existence
    /// confirmation must `get_by_order_id` first.
    pub fn delete(&self, order_id: &str) -> Result<(), StoreError> {
        let conn = lock_writer(&self.write_conn)?;
        conn.execute("DELETE FROM purchases WHERE orderID = ?1", params![order_id])?;
        Ok(())
    }

    pub fn mark_as_read(&self, order_id: &str) -> Result<(), StoreError> {
        let conn = lock_writer(&self.write_conn)?;
        conn.execute(
            "UPDATE purchases SET read = 1 WHERE orderID = ?1",
            params![order_id],
        )?;
        Ok(())
    }

    pub fn mark_as_unread(&self, order_id: &str) -> Result<(), StoreError> {
        let conn = lock_writer(&self.write_conn)?;
        conn.execute(
            "UPDATE purchases SET read = 0 WHERE orderID = ?1",
            params![order_id],
        )?;
        Ok(())
    }

    /// Records observed funding. Transaction records merge by txid with what
    /// is already stored; a later `put` on the same key will not erase the
    /// result.
    pub fn update_funding(
        &self,
        order_id: &str,
        funded: bool,
        records: &[TransactionRecord],
    ) -> Result<(), StoreError> {
        let conn = lock_writer(&self.write_conn)?;
        let existing = conn
            .query_row(
                "SELECT transactions FROM purchases WHERE orderID = ?1",
                params![order_id],
                |row| row.get::<_, Option<String>>(0),
            )
            .optional()?;

        let mut merged = decode_transaction_records(existing.flatten().as_deref())?;
        for record in records {
            match merged.iter_mut().find(|known| known.txid == record.txid) {
                Some(known) => *known = record.clone(),
                None => merged.push(record.clone()),
            }
        }
        let payload = encode_transaction_records(&merged)?;

        conn.execute(
            "UPDATE purchases SET funded = ?2, transactions = ?3 WHERE orderID = ?1",
            params![order_id, i64::from(funded), payload],
        )?;
        Ok(())
    }

    pub fn count(&self) -> Result<usize, StoreError> {
        let conn = self.read_pool.get()?;
        let count = conn.query_row("SELECT COUNT(*) FROM purchases", [], |row| {
            row.get::<_, i64>(0)
        })?;
        Ok(usize::try_from(count).unwrap_or_default())
    }

    /// Filtered, searchable, paginated listing query. An empty
    /// `state_filter` matches every state; `limit <= 0` means unlimited;
    /// `exclude` drops the given keys before counting, so `total` always
    /// reflects the full filtered set.
    pub fn get_all(
        &self,
        state_filter: &[OrderState],
        search_term: &str,
        sort_ascending: bool,
        unread_first: bool,
        limit: i64,
        exclude: &[String],
    ) -> Result<Page<PurchaseListing>, StoreError> {
        let query = ListingQuery {
            table: "purchases",
            key_column: "orderID",
            columns: &[
                "orderID",
                "timestamp",
                "total",
                "title",
                "thumbnail",
                "vendorID",
                "vendorHandle",
                "shippingName",
                "shippingAddress",
                "state",
                "read",
            ],
            search_columns: &[
                "orderID",
                "title",
                "thumbnail",
                "vendorID",
                "vendorHandle",
                "shippingName",
                "shippingAddress",
                "paymentAddr",
            ],
            state_filter,
            search_term,
            sort_ascending,
            unread_first,
            limit,
            exclude,
        };

        let conn = self.read_pool.get()?;
        let (page_sql, page_args) = query.page_statement();
        let mut stmt = conn.prepare(&page_sql)?;
        let rows = stmt.query_map(params_from_iter(page_args), |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, i64>(1)?,
                row.get::<_, i64>(2)?,
                row.get::<_, String>(3)?,
                row.get::<_, String>(4)?,
                row.get::<_, String>(5)?,
                row.get::<_, String>(6)?,
                row.get::<_, String>(7)?,
                row.get::<_, String>(8)?,
                row.get::<_, i64>(9)?,
                row.get::<_, i64>(10)?,
            ))
        })?;

        let mut items = Vec::new();
        for row in rows {
            let (
                order_id,
                timestamp_raw,
                total_raw,
                title,
                thumbnail,
                vendor_id,
                vendor_handle,
                shipping_name,
                shipping_address,
                state_raw,
                read_raw,
            ) = row?;
            items.push(PurchaseListing {
                order_id,
                timestamp: timestamp_from_seconds(timestamp_raw)?,
                total: u64::try_from(total_raw).unwrap_or_default(),
                title,
                thumbnail,
                vendor_id,
                vendor_handle,
                shipping_name,
                shipping_address,
                state: order_state_from_int(state_raw)?,
                read: read_raw == 1,
            });
        }

        let (count_sql, count_args) = query.count_statement();
        let total = conn.query_row(&count_sql, params_from_iter(count_args), |row| {
            row.get::<_, i64>(0)
        })?;

        Ok(Page {
            items,
            total: usize::try_from(total).unwrap_or_default(),
        })
    }

    /// Purchases currently due a dispute-timeout reminder: still in a state
    /// where a dispute can be opened, structurally disputeable, and
    /// eligible under the notification policy. Read-only; sending the
    /// reminders and persisting new timestamps is the caller's business.
    pub fn purchases_ready_for_notification(&self) -> Result<Vec<PurchaseRecord>, StoreError> {
        let now = now_utc();
        let states = DISPUTE_NOTICE_STATES
            .iter()
            .map(|state| state.to_int().to_string())
            .collect::<Vec<_>>()
            .join(", ");
        let statement = format!(
            "SELECT orderID, contract, state, timestamp, lastNotifiedAt
             FROM purchases
             WHERE (lastNotifiedAt - timestamp) < {} AND state IN ({states})",
            NOTICE_WINDOW.whole_seconds()
        );

        let conn = self.read_pool.get()?;
        let mut stmt = conn.prepare(&statement)?;
        let rows = stmt.query_map([], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, Option<String>>(1)?,
                row.get::<_, i64>(2)?,
                row.get::<_, i64>(3)?,
                row.get::<_, i64>(4)?,
            ))
        })?;

        let mut due = Vec::new();
        for row in rows {
            let (order_id, contract_raw, state_raw, timestamp_raw, notified_raw) = row?;
            let Some(contract_raw) = contract_raw else {
                continue;
            };
            let contract = decode_contract_text(&contract_raw)?;
            if !contract.is_disputeable() {
                continue;
            }

            let timestamp = timestamp_from_seconds(timestamp_raw)?;
            let last_notified_at = timestamp_from_seconds(notified_raw)?;
            if !notification_due(timestamp, last_notified_at, now) {
                continue;
            }

            due.push(PurchaseRecord {
                order_id,
                contract,
                state: order_state_from_int(state_raw)?,
                timestamp,
                last_notified_at,
            });
        }
        Ok(due)
    }

    /// Persists one updated `lastNotifiedAt` per record. All rows update in
    /// a single transaction; on any failure none of them do.
    pub fn update_purchases_last_notified_at(
        &self,
        records: &[PurchaseRecord],
    ) -> Result<(), StoreError> {
        let mut conn = lock_writer(&self.write_conn)?;
        let tx = conn.transaction()?;
        {
            let mut stmt =
                tx.prepare("UPDATE purchases SET lastNotifiedAt = ?1 WHERE orderID = ?2")?;
            for record in records {
                stmt.execute(params![
                    record.last_notified_at.unix_timestamp(),
                    record.order_id
                ])?;
            }
        }
        tx.commit()?;
        Ok(())
    }
}

/// A fully decoded dispute case row, minus payout material.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CaseMetadata {
    pub buyer_contract: Option<Contract>,
    pub vendor_contract: Option<Contract>,
    pub buyer_validation_errors: Vec<String>,
    pub vendor_validation_errors: Vec<String>,
    pub state: OrderState,
    pub read: bool,
    pub timestamp: OffsetDateTime,
    pub buyer_opened: bool,
    pub claim: String,
    pub resolution: Option<DisputeResolution>,
}

/// Everything needed to build a payout once a dispute closes. Contracts and
/// outpoints are `None` until the corresponding party submits.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PayoutDetails {
    pub buyer_contract: Option<Contract>,
    pub vendor_contract: Option<Contract>,
    pub buyer_payout_address: String,
    pub vendor_payout_address: String,
    pub buyer_outpoints: Option<Vec<Outpoint>>,
    pub vendor_outpoints: Option<Vec<Outpoint>>,
    pub state: OrderState,
}

/// Case summary for UI listings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CaseListing {
    pub case_id: String,
    pub timestamp: OffsetDateTime,
    pub state: OrderState,
    pub read: bool,
    pub buyer_opened: bool,
    pub claim: String,
}

#[derive(Clone)]
pub struct CaseStore {
    write_conn: Arc<Mutex<Connection>>,
    read_pool: Pool<SqliteConnectionManager>,
}

impl CaseStore {
    /// Creates the case row, or resets it if `case_id` already exists.
    /// Party submissions attach later through `update_buyer_info` /
    /// `update_vendor_info`; a replace clears them. The claim is stored
    /// lower-cased for search; the notification timestamp survives.
    pub fn put(
        &self,
        case_id: &str,
        state: OrderState,
        buyer_opened: bool,
        claim: &str,
    ) -> Result<(), StoreError> {
        let conn = lock_writer(&self.write_conn)?;
        conn.execute(
            "INSERT OR REPLACE INTO cases(
                caseID, state, read, buyerOpened, claim, timestamp, lastNotifiedAt
             ) VALUES (
                ?1, ?2, 0, ?3, ?4, ?5,
                COALESCE((SELECT lastNotifiedAt FROM cases WHERE caseID = ?1), 0)
             )",
            params![
                case_id,
                state.to_int(),
                i64::from(buyer_opened),
                claim.to_lowercase(),
                now_utc().unix_timestamp(),
            ],
        )?;
        Ok(())
    }

    /// Removes the row if it exists. Idempotent, like the purchase variant.
    pub fn delete(&self, case_id: &str) -> Result<(), StoreError> {
        let conn = lock_writer(&self.write_conn)?;
        conn.execute("DELETE FROM cases WHERE caseID = ?1", params![case_id])?;
        Ok(())
    }

    pub fn mark_as_read(&self, case_id: &str) -> Result<(), StoreError> {
        let conn = lock_writer(&self.write_conn)?;
        conn.execute("UPDATE cases SET read = 1 WHERE caseID = ?1", params![case_id])?;
        Ok(())
    }

    pub fn mark_as_unread(&self, case_id: &str) -> Result<(), StoreError> {
        let conn = lock_writer(&self.write_conn)?;
        conn.execute("UPDATE cases SET read = 0 WHERE caseID = ?1", params![case_id])?;
        Ok(())
    }

    /// Stores the buyer's submission. A `None` contract or outpoint list is
    /// stored as NULL so a later read reports "not yet submitted" rather
    /// than "submitted empty".
    pub fn update_buyer_info(
        &self,
        case_id: &str,
        contract: Option<&Contract>,
        validation_errors: &[String],
        payout_address: &str,
        outpoints: Option<&[Outpoint]>,
    ) -> Result<(), StoreError> {
        let contract_blob = contract.map(encode_contract_blob).transpose()?;
        let errors_json = encode_string_list(validation_errors)?;
        let outpoints_json = outpoints.map(encode_outpoints).transpose()?;

        let conn = lock_writer(&self.write_conn)?;
        conn.execute(
            "UPDATE cases SET
                buyerContract = ?2,
                buyerValidationErrors = ?3,
                buyerPayoutAddress = ?4,
                buyerOutpoints = ?5
             WHERE caseID = ?1",
            params![case_id, contract_blob, errors_json, payout_address, outpoints_json],
        )?;
        Ok(())
    }

    /// Vendor-side counterpart of `update_buyer_info`.
    pub fn update_vendor_info(
        &self,
        case_id: &str,
        contract: Option<&Contract>,
        validation_errors: &[String],
        payout_address: &str,
        outpoints: Option<&[Outpoint]>,
    ) -> Result<(), StoreError> {
        let contract_blob = contract.map(encode_contract_blob).transpose()?;
        let errors_json = encode_string_list(validation_errors)?;
        let outpoints_json = outpoints.map(encode_outpoints).transpose()?;

        let conn = lock_writer(&self.write_conn)?;
        conn.execute(
            "UPDATE cases SET
                vendorContract = ?2,
                vendorValidationErrors = ?3,
                vendorPayoutAddress = ?4,
                vendorOutpoints = ?5
             WHERE caseID = ?1",
            params![case_id, contract_blob, errors_json, payout_address, outpoints_json],
        )?;
        Ok(())
    }

    /// Moves the case into its terminal resolved state and stores the
    /// resolution document. Unlike the other mutators this one requires the
    /// row to exist.
    pub fn mark_as_closed(
        &self,
        case_id: &str,
        resolution: &DisputeResolution,
    ) -> Result<(), StoreError> {
        let blob = encode_resolution_blob(resolution)?;
        let conn = lock_writer(&self.write_conn)?;
        let updated = conn.execute(
            "UPDATE cases SET state = ?2, resolution = ?3 WHERE caseID = ?1",
            params![case_id, OrderState::Resolved.to_int(), blob],
        )?;
        if updated == 0 {
            return Err(StoreError::NotFound(case_id.to_string()));
        }
        Ok(())
    }

    pub fn count(&self) -> Result<usize, StoreError> {
        let conn = self.read_pool.get()?;
        let count =
            conn.query_row("SELECT COUNT(*) FROM cases", [], |row| row.get::<_, i64>(0))?;
        Ok(usize::try_from(count).unwrap_or_default())
    }

    pub fn get_case_metadata(&self, case_id: &str) -> Result<CaseMetadata, StoreError> {
        let conn = self.read_pool.get()?;
        let mut stmt = conn.prepare(
            "SELECT buyerContract, vendorContract, buyerValidationErrors,
                    vendorValidationErrors, state, read, timestamp, buyerOpened,
                    claim, resolution
             FROM cases
             WHERE caseID = ?1",
        )?;
        let row = stmt
            .query_row(params![case_id], |row| {
                Ok((
                    row.get::<_, Option<Vec<u8>>>(0)?,
                    row.get::<_, Option<Vec<u8>>>(1)?,
                    row.get::<_, Option<String>>(2)?,
                    row.get::<_, Option<String>>(3)?,
                    row.get::<_, i64>(4)?,
                    row.get::<_, i64>(5)?,
                    row.get::<_, i64>(6)?,
                    row.get::<_, i64>(7)?,
                    row.get::<_, String>(8)?,
                    row.get::<_, Option<Vec<u8>>>(9)?,
                ))
            })
            .optional()?;

        let Some((
            buyer_raw,
            vendor_raw,
            buyer_errors_raw,
            vendor_errors_raw,
            state_raw,
            read_raw,
            timestamp_raw,
            buyer_opened_raw,
            claim,
            resolution_raw,
        )) = row
        else {
            return Err(StoreError::NotFound(case_id.to_string()));
        };

        Ok(CaseMetadata {
            buyer_contract: decode_contract_blob(buyer_raw.as_deref())?,
            vendor_contract: decode_contract_blob(vendor_raw.as_deref())?,
            buyer_validation_errors: decode_string_list(buyer_errors_raw.as_deref())?,
            vendor_validation_errors: decode_string_list(vendor_errors_raw.as_deref())?,
            state: order_state_from_int(state_raw)?,
            read: read_raw == 1,
            timestamp: timestamp_from_seconds(timestamp_raw)?,
            buyer_opened: buyer_opened_raw == 1,
            claim,
            resolution: decode_resolution_blob(resolution_raw.as_deref())?,
        })
    }

    pub fn get_payout_details(&self, case_id: &str) -> Result<PayoutDetails, StoreError> {
        let conn = self.read_pool.get()?;
        let mut stmt = conn.prepare(
            "SELECT buyerContract, vendorContract, buyerPayoutAddress,
                    vendorPayoutAddress, buyerOutpoints, vendorOutpoints, state
             FROM cases
             WHERE caseID = ?1",
        )?;
        let row = stmt
            .query_row(params![case_id], |row| {
                Ok((
                    row.get::<_, Option<Vec<u8>>>(0)?,
                    row.get::<_, Option<Vec<u8>>>(1)?,
                    row.get::<_, Option<String>>(2)?,
                    row.get::<_, Option<String>>(3)?,
                    row.get::<_, Option<String>>(4)?,
                    row.get::<_, Option<String>>(5)?,
                    row.get::<_, i64>(6)?,
                ))
            })
            .optional()?;

        let Some((
            buyer_raw,
            vendor_raw,
            buyer_address,
            vendor_address,
            buyer_outpoints_raw,
            vendor_outpoints_raw,
            state_raw,
        )) = row
        else {
            return Err(StoreError::NotFound(case_id.to_string()));
        };

        Ok(PayoutDetails {
            buyer_contract: decode_contract_blob(buyer_raw.as_deref())?,
            vendor_contract: decode_contract_blob(vendor_raw.as_deref())?,
            buyer_payout_address: buyer_address.unwrap_or_default(),
            vendor_payout_address: vendor_address.unwrap_or_default(),
            buyer_outpoints: decode_outpoints(buyer_outpoints_raw.as_deref())?,
            vendor_outpoints: decode_outpoints(vendor_outpoints_raw.as_deref())?,
            state: order_state_from_int(state_raw)?,
        })
    }

    /// Filtered, searchable, paginated case listing. Same filter semantics
    /// as the purchase variant; search covers the case key and the claim.
    pub fn get_all(
        &self,
        state_filter: &[OrderState],
        search_term: &str,
        sort_ascending: bool,
        unread_first: bool,
        limit: i64,
        exclude: &[String],
    ) -> Result<Page<CaseListing>, StoreError> {
        let query = ListingQuery {
            table: "cases",
            key_column: "caseID",
            columns: &["caseID", "timestamp", "state", "read", "buyerOpened", "claim"],
            search_columns: &["caseID", "claim"],
            state_filter,
            search_term,
            sort_ascending,
            unread_first,
            limit,
            exclude,
        };

        let conn = self.read_pool.get()?;
        let (page_sql, page_args) = query.page_statement();
        let mut stmt = conn.prepare(&page_sql)?;
        let rows = stmt.query_map(params_from_iter(page_args), |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, i64>(1)?,
                row.get::<_, i64>(2)?,
                row.get::<_, i64>(3)?,
                row.get::<_, i64>(4)?,
                row.get::<_, String>(5)?,
            ))
        })?;

        let mut items = Vec::new();
        for row in rows {
            let (case_id, timestamp_raw, state_raw, read_raw, buyer_opened_raw, claim) = row?;
            items.push(CaseListing {
                case_id,
                timestamp: timestamp_from_seconds(timestamp_raw)?,
                state: order_state_from_int(state_raw)?,
                read: read_raw == 1,
                buyer_opened: buyer_opened_raw == 1,
                claim,
            });
        }

        let (count_sql, count_args) = query.count_statement();
        let total = conn.query_row(&count_sql, params_from_iter(count_args), |row| {
            row.get::<_, i64>(0)
        })?;

        Ok(Page {
            items,
            total: usize::try_from(total).unwrap_or_default(),
        })
    }

    /// Dispute cases currently due an expiry reminder. A case row is a
    /// dispute by construction, so only the notification policy applies.
    /// Read-only.
    pub fn disputes_ready_for_notification(&self) -> Result<Vec<DisputeCaseRecord>, StoreError> {
        let now = now_utc();
        let statement = format!(
            "SELECT caseID, timestamp, lastNotifiedAt, buyerContract, vendorContract, buyerOpened
             FROM cases
             WHERE (lastNotifiedAt - timestamp) < {}",
            NOTICE_WINDOW.whole_seconds()
        );

        let conn = self.read_pool.get()?;
        let mut stmt = conn.prepare(&statement)?;
        let rows = stmt.query_map([], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, i64>(1)?,
                row.get::<_, i64>(2)?,
                row.get::<_, Option<Vec<u8>>>(3)?,
                row.get::<_, Option<Vec<u8>>>(4)?,
                row.get::<_, i64>(5)?,
            ))
        })?;

        let mut due = Vec::new();
        for row in rows {
            let (case_id, timestamp_raw, notified_raw, buyer_raw, vendor_raw, buyer_opened_raw) =
                row?;
            let timestamp = timestamp_from_seconds(timestamp_raw)?;
            let last_notified_at = timestamp_from_seconds(notified_raw)?;
            if !notification_due(timestamp, last_notified_at, now) {
                continue;
            }

            due.push(DisputeCaseRecord {
                case_id,
                timestamp,
                last_notified_at,
                buyer_contract: decode_contract_blob(buyer_raw.as_deref())?,
                vendor_contract: decode_contract_blob(vendor_raw.as_deref())?,
                is_buyer_initiated: buyer_opened_raw == 1,
            });
        }
        Ok(due)
    }

    /// Persists one updated `lastNotifiedAt` per record, all in a single
    /// transaction; on any failure none of them update.
    pub fn update_disputes_last_notified_at(
        &self,
        records: &[DisputeCaseRecord],
    ) -> Result<(), StoreError> {
        let mut conn = lock_writer(&self.write_conn)?;
        let tx = conn.transaction()?;
        {
            let mut stmt = tx.prepare("UPDATE cases SET lastNotifiedAt = ?1 WHERE caseID = ?2")?;
            for record in records {
                stmt.execute(params![
                    record.last_notified_at.unix_timestamp(),
                    record.case_id
                ])?;
            }
        }
        tx.commit()?;
        Ok(())
    }
}

struct ListingQuery<'a> {
    table: &'a str,
    key_column: &'a str,
    columns: &'a [&'a str],
    search_columns: &'a [&'a str],
    state_filter: &'a [OrderState],
    search_term: &'a str,
    sort_ascending: bool,
    unread_first: bool,
    limit: i64,
    exclude: &'a [String],
}

impl ListingQuery<'_> {
    fn filter_clause(&self) -> (String, Vec<Value>) {
        let mut clauses = Vec::new();
        let mut args = Vec::new();

        if !self.state_filter.is_empty() {
            let placeholders = vec!["?"; self.state_filter.len()].join(", ");
            clauses.push(format!("state IN ({placeholders})"));
            args.extend(
                self.state_filter
                    .iter()
                    .map(|state| Value::Integer(state.to_int())),
            );
        }

        if !self.search_term.is_empty() {
            let pattern = format!("%{}%", self.search_term);
            let likes = self
                .search_columns
                .iter()
                .map(|column| format!("{column} LIKE ?"))
                .collect::<Vec<_>>()
                .join(" OR ");
            clauses.push(format!("({likes})"));
            args.extend(
                self.search_columns
                    .iter()
                    .map(|_| Value::Text(pattern.clone())),
            );
        }

        if !self.exclude.is_empty() {
            let placeholders = vec!["?"; self.exclude.len()].join(", ");
            clauses.push(format!("{} NOT IN ({placeholders})", self.key_column));
            args.extend(self.exclude.iter().map(|key| Value::Text(key.clone())));
        }

        if clauses.is_empty() {
            (String::new(), args)
        } else {
            (format!(" WHERE {}", clauses.join(" AND ")), args)
        }
    }

    fn page_statement(&self) -> (String, Vec<Value>) {
        let (filter, args) = self.filter_clause();
        let direction = if self.sort_ascending { "ASC" } else { "DESC" };
        let order = if self.unread_first {
            format!(
                " ORDER BY read ASC, timestamp {direction}, {key} ASC",
                key = self.key_column
            )
        } else {
            format!(
                " ORDER BY timestamp {direction}, {key} ASC",
                key = self.key_column
            )
        };
        let limit = if self.limit > 0 {
            format!(" LIMIT {}", self.limit)
        } else {
            String::new()
        };

        (
            format!(
                "SELECT {} FROM {}{filter}{order}{limit}",
                self.columns.join(", "),
                self.table
            ),
            args,
        )
    }

    fn count_statement(&self) -> (String, Vec<Value>) {
        let (filter, args) = self.filter_clause();
        (format!("SELECT COUNT(*) FROM {}{filter}", self.table), args)
    }
}

fn encode_contract_text(contract: &Contract) -> Result<String, StoreError> {
    serde_json::to_string_pretty(contract)
        .map_err(|err| StoreError::Serialization(format!("contract encode: {err}")))
}

fn decode_contract_text(raw: &str) -> Result<Contract, StoreError> {
    if raw.is_empty() {
        return Ok(Contract::default());
    }
    serde_json::from_str(raw)
        .map_err(|err| StoreError::Serialization(format!("contract decode: {err}")))
}

fn encode_contract_blob(contract: &Contract) -> Result<Vec<u8>, StoreError> {
    bincode::serialize(contract)
        .map_err(|err| StoreError::Serialization(format!("contract encode: {err}")))
}

fn decode_contract_blob(raw: Option<&[u8]>) -> Result<Option<Contract>, StoreError> {
    match raw {
        None => Ok(None),
        Some(bytes) if bytes.is_empty() => Ok(None),
        Some(bytes) => bincode::deserialize(bytes)
            .map(Some)
            .map_err(|err| StoreError::Serialization(format!("contract decode: {err}"))),
    }
}

fn encode_resolution_blob(resolution: &DisputeResolution) -> Result<Vec<u8>, StoreError> {
    bincode::serialize(resolution)
        .map_err(|err| StoreError::Serialization(format!("resolution encode: {err}")))
}

fn decode_resolution_blob(raw: Option<&[u8]>) -> Result<Option<DisputeResolution>, StoreError> {
    match raw {
        None => Ok(None),
        Some(bytes) if bytes.is_empty() => Ok(None),
        Some(bytes) => bincode::deserialize(bytes)
            .map(Some)
            .map_err(|err| StoreError::Serialization(format!("resolution decode: {err}"))),
    }
}

fn encode_string_list(values: &[String]) -> Result<String, StoreError> {
    serde_json::to_string(values)
        .map_err(|err| StoreError::Serialization(format!("string list encode: {err}")))
}

fn decode_string_list(raw: Option<&str>) -> Result<Vec<String>, StoreError> {
    match raw {
        None => Ok(Vec::new()),
        Some(text) if text.is_empty() => Ok(Vec::new()),
        Some(text) => serde_json::from_str(text)
            .map_err(|err| StoreError::Serialization(format!("string list decode: {err}"))),
    }
}

fn encode_outpoints(outpoints: &[Outpoint]) -> Result<String, StoreError> {
    serde_json::to_string(outpoints)
        .map_err(|err| StoreError::Serialization(format!("outpoint encode: {err}")))
}

fn decode_outpoints(raw: Option<&str>) -> Result<Option<Vec<Outpoint>>, StoreError> {
    match raw {
        None => Ok(None),
        Some(text) if text.is_empty() => Ok(None),
        Some(text) => serde_json::from_str(text)
            .map(Some)
            .map_err(|err| StoreError::Serialization(format!("outpoint decode: {err}"))),
    }
}

fn encode_transaction_records(records: &[TransactionRecord]) -> Result<String, StoreError> {
    serde_json::to_string(records)
        .map_err(|err| StoreError::Serialization(format!("transaction records encode: {err}")))
}

fn decode_transaction_records(raw: Option<&str>) -> Result<Vec<TransactionRecord>, StoreError> {
    match raw {
        None => Ok(Vec::new()),
        Some(text) if text.is_empty() => Ok(Vec::new()),
        Some(text) => serde_json::from_str(text).map_err(|err| {
            StoreError::Serialization(format!("transaction records decode: {err}"))
        }),
    }
}

fn order_state_from_int(value: i64) -> Result<OrderState, StoreError> {
    OrderState::from_int(value)
        .ok_or_else(|| StoreError::Serialization(format!("unknown order state: {value}")))
}

fn timestamp_from_seconds(seconds: i64) -> Result<OffsetDateTime, StoreError> {
    from_unix_seconds(seconds).map_err(|err| StoreError::Serialization(err.to_string()))
}

#[allow(clippy::type_complexity)]
fn decode_purchase_details(
    raw: (Option<String>, i64, Option<i64>, Option<String>, i64),
) -> Result<PurchaseDetails, StoreError> {
    let (contract_raw, state_raw, funded_raw, transactions_raw, read_raw) = raw;
    let contract = match contract_raw {
        Some(text) => decode_contract_text(&text)?,
        None => Contract::default(),
    };
    Ok(PurchaseDetails {
        contract,
        state: order_state_from_int(state_raw)?,
        funded: funded_raw == Some(1),
        records: decode_transaction_records(transactions_raw.as_deref())?,
        read: read_raw == 1,
    })
}
