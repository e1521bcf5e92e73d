use std::path::Path;
use std::str::FromStr;

use async_trait::async_trait;
use payjoin::bitcoin::consensus::encode::{deserialize, serialize};
use payjoin::bitcoin::{Amount, OutPoint, ScriptBuf, Txid};
use payjoin::receive::{
    tracking_key, ChainPaymentMethod, DerivationScheme, InvoiceRepository, PayjoinInformation,
    PaymentRecord, ScriptType,
};
use payjoin::ImplementationError;
use r2d2::Pool;
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use tokio::task::spawn_blocking;

mod error;
pub use error::Error;
use error::Result;

#[inline]
pub(crate) fn now() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|elapsed| elapsed.as_secs() as i64)
        .unwrap_or_default()
}

/// Invoices and their payments, for a single crypto code.
#[derive(Clone)]
pub struct Database {
    pool: Pool<SqliteConnectionManager>,
    crypto_code: String,
}

impl Database {
    pub fn create(path: impl AsRef<Path>, crypto_code: &str) -> Result<Self> {
        let manager = SqliteConnectionManager::file(path.as_ref()).with_init(enable_foreign_keys);
        let pool = Pool::new(manager)?;
        Self::with_pool(pool, crypto_code)
    }

    /// A database living in its only pooled connection.
    pub fn in_memory(crypto_code: &str) -> Result<Self> {
        let pool = Pool::builder()
            .max_size(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .build(SqliteConnectionManager::memory().with_init(enable_foreign_keys))?;
        Self::with_pool(pool, crypto_code)
    }

    fn with_pool(pool: Pool<SqliteConnectionManager>, crypto_code: &str) -> Result<Self> {
        Self::init_schema(&*pool.get()?)?;
        Ok(Self { pool, crypto_code: crypto_code.to_uppercase() })
    }

    fn init_schema(conn: &Connection) -> Result<()> {
        conn.execute(
            "CREATE TABLE IF NOT EXISTS invoices (
                invoice_id TEXT PRIMARY KEY,
                crypto_code TEXT NOT NULL,
                tracking_key TEXT NOT NULL,
                deposit_script BLOB NOT NULL,
                payjoin_enabled INTEGER NOT NULL,
                wallet_id TEXT NOT NULL,
                script_type TEXT NOT NULL,
                due_sat INTEGER NOT NULL,
                created_at INTEGER NOT NULL
            )",
            [],
        )?;

        conn.execute(
            "CREATE INDEX IF NOT EXISTS invoices_by_tracking_key ON invoices (tracking_key)",
            [],
        )?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS payments (
                outpoint BLOB PRIMARY KEY,
                invoice_id TEXT NOT NULL,
                output BLOB NOT NULL,
                confirmation_count INTEGER NOT NULL,
                payjoin TEXT,
                created_at INTEGER NOT NULL,
                FOREIGN KEY(invoice_id) REFERENCES invoices(invoice_id)
            )",
            [],
        )?;

        Ok(())
    }

    pub(crate) fn get_connection(&self) -> Result<r2d2::PooledConnection<SqliteConnectionManager>> {
        Ok(self.pool.get()?)
    }

    /// Runs the blocking `query` off the async runtime.
    async fn blocking<T, F>(&self, query: F) -> Result<T, ImplementationError>
    where
        T: Send + 'static,
        F: FnOnce(&Database) -> Result<T> + Send + 'static,
    {
        let db = self.clone();
        Ok(spawn_blocking(move || query(&db)).await??)
    }

    pub fn add_invoice(&self, invoice_id: &str, method: &ChainPaymentMethod) -> Result<()> {
        let conn = self.get_connection()?;
        conn.execute(
            "INSERT INTO invoices (invoice_id, crypto_code, tracking_key, deposit_script,
                payjoin_enabled, wallet_id, script_type, due_sat, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                invoice_id,
                self.crypto_code,
                tracking_key(&method.deposit_script, &self.crypto_code),
                method.deposit_script.as_bytes(),
                method.payjoin_enabled,
                method.derivation.wallet_id,
                method.derivation.script_type.as_str(),
                sats_to_sql(method.due),
                now(),
            ],
        )?;
        Ok(())
    }

    pub fn payments(&self, invoice_id: &str) -> Result<Vec<PaymentRecord>> {
        let conn = self.get_connection()?;
        let mut stmt = conn.prepare(
            "SELECT outpoint, output, confirmation_count, payjoin FROM payments
             WHERE invoice_id = ?1 ORDER BY created_at, rowid",
        )?;
        let rows = stmt
            .query_map(params![invoice_id], |row| {
                Ok((
                    row.get::<_, Vec<u8>>(0)?,
                    row.get::<_, Vec<u8>>(1)?,
                    row.get::<_, i32>(2)?,
                    row.get::<_, Option<String>>(3)?,
                ))
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        rows.into_iter()
            .map(|(outpoint, output, confirmation_count, payjoin)| -> Result<PaymentRecord> {
                Ok(PaymentRecord {
                    outpoint: deserialize(&outpoint)?,
                    output: deserialize(&output)?,
                    confirmation_count,
                    payjoin: payjoin
                        .map(|json| serde_json::from_str::<StoredPayjoin>(&json))
                        .transpose()?
                        .map(PayjoinInformation::from),
                })
            })
            .collect()
    }

    fn find_invoice_ids(&self, key: &str) -> Result<Vec<String>> {
        let conn = self.get_connection()?;
        let mut stmt = conn.prepare(
            "SELECT invoice_id FROM invoices WHERE tracking_key = ?1 ORDER BY created_at, rowid",
        )?;
        let ids = stmt
            .query_map(params![key], |row| row.get::<_, String>(0))?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(ids)
    }

    fn find_payment_method(&self, invoice_id: &str) -> Result<Option<ChainPaymentMethod>> {
        let conn = self.get_connection()?;
        let row = conn
            .query_row(
                "SELECT deposit_script, payjoin_enabled, wallet_id, script_type, due_sat,
                    EXISTS (SELECT 1 FROM payments p WHERE p.invoice_id = i.invoice_id)
                 FROM invoices i WHERE invoice_id = ?1 AND crypto_code = ?2",
                params![invoice_id, self.crypto_code],
                |row| {
                    Ok((
                        row.get::<_, Vec<u8>>(0)?,
                        row.get::<_, bool>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, String>(3)?,
                        row.get::<_, i64>(4)?,
                        row.get::<_, bool>(5)?,
                    ))
                },
            )
            .optional()?;

        let Some((script, payjoin_enabled, wallet_id, script_type, due, has_payments)) = row else {
            return Ok(None);
        };
        let script_type =
            ScriptType::from_str(&script_type).map_err(|e| Error::Corrupt(e.to_string()))?;
        Ok(Some(ChainPaymentMethod {
            deposit_script: ScriptBuf::from_bytes(script),
            payjoin_enabled,
            derivation: DerivationScheme { wallet_id, script_type },
            due: sats_from_sql(due)?,
            has_payments,
        }))
    }

    /// Inserts the payment unless its outpoint is already recorded. Returns whether it was new.
    fn insert_payment(&self, invoice_id: &str, payment: &PaymentRecord) -> Result<bool> {
        let conn = self.get_connection()?;
        let payjoin = payment
            .payjoin
            .as_ref()
            .map(|info| serde_json::to_string(&StoredPayjoin::from(info)))
            .transpose()?;
        let inserted = conn.execute(
            "INSERT OR IGNORE INTO payments (outpoint, invoice_id, output, confirmation_count,
                payjoin, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                serialize(&payment.outpoint),
                invoice_id,
                serialize(&payment.output),
                payment.confirmation_count,
                payjoin,
                now(),
            ],
        )? == 1;
        Ok(inserted)
    }
}

#[async_trait]
impl InvoiceRepository for Database {
    async fn find_invoices(&self, key: &str) -> Result<Vec<String>, ImplementationError> {
        let key = key.to_owned();
        self.blocking(move |db| db.find_invoice_ids(&key)).await
    }

    async fn payment_method(
        &self,
        invoice_id: &str,
        crypto_code: &str,
    ) -> Result<Option<ChainPaymentMethod>, ImplementationError> {
        if !crypto_code.eq_ignore_ascii_case(&self.crypto_code) {
            return Ok(None);
        }
        let invoice_id = invoice_id.to_owned();
        self.blocking(move |db| db.find_payment_method(&invoice_id)).await
    }

    async fn add_payment(
        &self,
        invoice_id: &str,
        payment: PaymentRecord,
    ) -> Result<Option<PaymentRecord>, ImplementationError> {
        let outpoint = payment.outpoint;
        let invoice_id = invoice_id.to_owned();
        let recorded = self
            .blocking(move |db| Ok(db.insert_payment(&invoice_id, &payment)?.then_some(payment)))
            .await?;
        if recorded.is_none() {
            tracing::debug!("Payment {outpoint} already recorded");
        }
        Ok(recorded)
    }
}

#[derive(Serialize, Deserialize)]
struct StoredPayjoin {
    proposed_txid: Txid,
    coinjoin_value_sat: u64,
    contributed_outpoints: Vec<OutPoint>,
}

impl From<&PayjoinInformation> for StoredPayjoin {
    fn from(info: &PayjoinInformation) -> Self {
        StoredPayjoin {
            proposed_txid: info.proposed_txid,
            coinjoin_value_sat: info.coinjoin_value.to_sat(),
            contributed_outpoints: info.contributed_outpoints.clone(),
        }
    }
}

impl From<StoredPayjoin> for PayjoinInformation {
    fn from(stored: StoredPayjoin) -> Self {
        PayjoinInformation {
            proposed_txid: stored.proposed_txid,
            coinjoin_value: Amount::from_sat(stored.coinjoin_value_sat),
            contributed_outpoints: stored.contributed_outpoints,
        }
    }
}

fn enable_foreign_keys(conn: &mut Connection) -> rusqlite::Result<()> {
    conn.execute_batch("PRAGMA foreign_keys = ON;")
}

fn sats_to_sql(amount: Amount) -> i64 { amount.to_sat().try_into().unwrap_or(i64::MAX) }

fn sats_from_sql(sats: i64) -> Result<Amount> {
    u64::try_from(sats)
        .map(Amount::from_sat)
        .map_err(|_| Error::Corrupt(format!("negative amount {sats}")))
}
