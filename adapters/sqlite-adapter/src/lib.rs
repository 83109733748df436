//! sqlite-adapter: SQLite implementation of the storage ports.
//!
//! Purpose
//! - Provide a durable, file-based store so the earnings pipeline runs
//!   locally without external services.
//! - Implements every repository port from the `domain` crate; the atomic
//!   operations (`record_click`, `apply_settlement`, `open_rate_period`) each
//!   run inside one `BEGIN IMMEDIATE` transaction.
//!
//! Notes
//! - Uses `rusqlite` with the `bundled` feature for portability.
//! - Stores timestamps as milliseconds since UNIX_EPOCH and money as integer
//!   nano-units. A rate change inside the open period's millisecond starts
//!   on the next millisecond.
//! - A partial unique index allows at most one open rate period.
//! - `SQLITE_BUSY` / `SQLITE_LOCKED` surface as `CoreError::Conflict` so the
//!   services retry with fresh reads.

use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use domain::clicks::{milestone_crossed, still_billable};
use domain::{
    AccountStatus, ClickEvent, ClickId, ClickRepository, CoreError, Link, LinkRepository, Money,
    NewClick, RatePeriod, RatePeriodId, RateRepository, RequesterKey, Rule, RuleKind,
    SettleReason, Settlement, SettlementApplied, SettlementRepository, ShortCode,
    SponsorRepository, SponsorRule, User, UserId, UserRepository,
};
use rusqlite::{params, Connection, ErrorCode, OptionalExtension, Row, TransactionBehavior};

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// SQLite-backed store.
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    /// Open (or create) a SQLite database at the given path and ensure schema.
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self, CoreError> {
        if let Some(dir) = path.as_ref().parent() {
            if !dir.as_os_str().is_empty() {
                std::fs::create_dir_all(dir)
                    .map_err(|e| CoreError::Repository(format!("create db dir: {e}")))?;
            }
        }
        let conn = Connection::open(path).map_err(map_sqerr)?;
        conn.busy_timeout(BUSY_TIMEOUT).map_err(map_sqerr)?;
        init_schema(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>, CoreError> {
        self.conn
            .lock()
            .map_err(|_| CoreError::Repository("mutex poisoned".into()))
    }
}

fn init_schema(conn: &Connection) -> Result<(), CoreError> {
    conn.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS links (
            code TEXT PRIMARY KEY,
            owner TEXT NOT NULL,
            destination TEXT NOT NULL,
            title TEXT,
            description TEXT,
            monetizable INTEGER NOT NULL DEFAULT 0,
            total_clicks INTEGER NOT NULL DEFAULT 0,
            real_clicks INTEGER NOT NULL DEFAULT 0,
            generated_earnings INTEGER NOT NULL DEFAULT 0,
            milestones_reached INTEGER NOT NULL DEFAULT 0,
            suspended INTEGER NOT NULL DEFAULT 0,
            created_at INTEGER NOT NULL,
            updated_at INTEGER
        );
        CREATE INDEX IF NOT EXISTS idx_links_owner ON links(owner, created_at);
        CREATE TABLE IF NOT EXISTS link_rules (
            code TEXT NOT NULL,
            position INTEGER NOT NULL,
            kind TEXT NOT NULL,
            target_url TEXT NOT NULL,
            PRIMARY KEY (code, position)
        );
        CREATE TABLE IF NOT EXISTS users (
            id TEXT PRIMARY KEY,
            status TEXT NOT NULL DEFAULT 'active',
            generated_earnings INTEGER NOT NULL DEFAULT 0,
            paid_out INTEGER NOT NULL DEFAULT 0,
            custom_rate INTEGER,
            created_at INTEGER NOT NULL
        );
        CREATE TABLE IF NOT EXISTS rate_periods (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            rate INTEGER NOT NULL,
            starts_at INTEGER NOT NULL,
            ends_at INTEGER
        );
        CREATE UNIQUE INDEX IF NOT EXISTS idx_rate_periods_open
            ON rate_periods((ends_at IS NULL)) WHERE ends_at IS NULL;
        CREATE TABLE IF NOT EXISTS click_events (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            code TEXT NOT NULL,
            clicked_at INTEGER NOT NULL,
            requester_key TEXT,
            client_token TEXT,
            client_first_use INTEGER NOT NULL,
            server_unique INTEGER NOT NULL,
            billable INTEGER NOT NULL DEFAULT 0,
            rate_applied INTEGER,
            amount INTEGER NOT NULL DEFAULT 0,
            reason TEXT,
            processed INTEGER NOT NULL DEFAULT 0,
            processed_at INTEGER
        );
        CREATE INDEX IF NOT EXISTS idx_click_events_code ON click_events(code, clicked_at);
        CREATE INDEX IF NOT EXISTS idx_click_events_pending ON click_events(processed, id);
        CREATE TABLE IF NOT EXISTS sponsor_rules (
            id TEXT PRIMARY KEY,
            code TEXT NOT NULL,
            sponsor_url TEXT NOT NULL,
            active INTEGER NOT NULL DEFAULT 1,
            expires_at INTEGER,
            views INTEGER NOT NULL DEFAULT 0,
            clicks INTEGER NOT NULL DEFAULT 0,
            created_at INTEGER NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_sponsor_rules_code ON sponsor_rules(code);
        "#,
    )
    .map_err(map_sqerr)
}

fn map_sqerr(e: rusqlite::Error) -> CoreError {
    if let rusqlite::Error::SqliteFailure(err, _) = &e {
        match err.code {
            ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked => {
                return CoreError::Conflict(format!("sqlite busy: {e}"))
            }
            ErrorCode::ConstraintViolation => return CoreError::AlreadyExists,
            _ => {}
        }
    }
    CoreError::Repository(format!("sqlite error: {e}"))
}

fn bad_row(what: &str) -> CoreError {
    CoreError::Repository(format!("bad {what} in db"))
}

fn to_millis(t: SystemTime) -> i64 {
    t.duration_since(UNIX_EPOCH)
        .unwrap_or(Duration::ZERO)
        .as_millis() as i64
}

fn from_millis(ms: i64) -> SystemTime {
    UNIX_EPOCH + Duration::from_millis(ms.max(0) as u64)
}

fn money_to_sql(m: Money) -> Result<i64, CoreError> {
    i64::try_from(m.as_nanos()).map_err(|_| CoreError::Repository("amount out of range".into()))
}

fn money_from_sql(v: i64) -> Result<Money, CoreError> {
    u64::try_from(v)
        .map(Money::from_nanos)
        .map_err(|_| bad_row("amount"))
}

fn add(a: Money, b: Money) -> Result<Money, CoreError> {
    a.checked_add(b)
        .ok_or_else(|| CoreError::Repository("earnings overflow".into()))
}

const LINK_COLUMNS: &str = "code, owner, destination, title, description, monetizable, total_clicks, real_clicks, generated_earnings, milestones_reached, suspended, created_at, updated_at";

fn row_to_link(row: &Row) -> Result<Link, CoreError> {
    let code: String = row.get(0).map_err(map_sqerr)?;
    let owner: String = row.get(1).map_err(map_sqerr)?;
    let updated_at: Option<i64> = row.get(12).map_err(map_sqerr)?;
    Ok(Link {
        code: ShortCode::new(code).map_err(|_| bad_row("code"))?,
        owner: UserId::new(owner).map_err(|_| bad_row("owner"))?,
        destination: row.get(2).map_err(map_sqerr)?,
        title: row.get(3).map_err(map_sqerr)?,
        description: row.get(4).map_err(map_sqerr)?,
        rules: Vec::new(),
        monetizable: row.get::<_, i64>(5).map_err(map_sqerr)? != 0,
        total_clicks: row.get::<_, i64>(6).map_err(map_sqerr)? as u64,
        real_clicks: row.get::<_, i64>(7).map_err(map_sqerr)? as u64,
        generated_earnings: money_from_sql(row.get(8).map_err(map_sqerr)?)?,
        milestones_reached: row.get::<_, i64>(9).map_err(map_sqerr)? as u64,
        suspended: row.get::<_, i64>(10).map_err(map_sqerr)? != 0,
        created_at: from_millis(row.get(11).map_err(map_sqerr)?),
        updated_at: updated_at.map(from_millis),
    })
}

fn load_rules(conn: &Connection, code: &str) -> Result<Vec<Rule>, CoreError> {
    let mut stmt = conn
        .prepare("SELECT kind, target_url, position FROM link_rules WHERE code = ?1 ORDER BY position")
        .map_err(map_sqerr)?;
    let mut rows = stmt.query(params![code]).map_err(map_sqerr)?;
    let mut out = Vec::new();
    while let Some(row) = rows.next().map_err(map_sqerr)? {
        let kind: String = row.get(0).map_err(map_sqerr)?;
        out.push(Rule {
            kind: RuleKind::parse(&kind).ok_or_else(|| bad_row("rule kind"))?,
            target_url: row.get(1).map_err(map_sqerr)?,
            position: row.get::<_, i64>(2).map_err(map_sqerr)? as u32,
        });
    }
    Ok(out)
}

fn write_rules(conn: &Connection, code: &str, rules: &[Rule]) -> Result<(), CoreError> {
    conn.execute("DELETE FROM link_rules WHERE code = ?1", params![code])
        .map_err(map_sqerr)?;
    for rule in rules {
        conn.execute(
            "INSERT INTO link_rules(code, position, kind, target_url) VALUES (?1, ?2, ?3, ?4)",
            params![code, rule.position as i64, rule.kind.as_str(), rule.target_url],
        )
        .map_err(map_sqerr)?;
    }
    Ok(())
}

fn get_link_on(conn: &Connection, code: &str) -> Result<Option<Link>, CoreError> {
    let sql = format!("SELECT {LINK_COLUMNS} FROM links WHERE code = ?1");
    let mut stmt = conn.prepare(&sql).map_err(map_sqerr)?;
    let mut rows = stmt.query(params![code]).map_err(map_sqerr)?;
    let Some(row) = rows.next().map_err(map_sqerr)? else {
        return Ok(None);
    };
    let mut link = row_to_link(row)?;
    link.rules = load_rules(conn, code)?;
    Ok(Some(link))
}

impl LinkRepository for SqliteStore {
    fn get_link(&self, code: &ShortCode) -> Result<Option<Link>, CoreError> {
        let conn = self.lock()?;
        get_link_on(&conn, code.as_str())
    }

    fn insert_link(&self, link: Link) -> Result<(), CoreError> {
        let mut conn = self.lock()?;
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(map_sqerr)?;
        tx.execute(
            &format!("INSERT INTO links({LINK_COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)"),
            params![
                link.code.as_str(),
                link.owner.as_str(),
                link.destination,
                link.title,
                link.description,
                link.monetizable as i64,
                link.total_clicks as i64,
                link.real_clicks as i64,
                money_to_sql(link.generated_earnings)?,
                link.milestones_reached as i64,
                link.suspended as i64,
                to_millis(link.created_at),
                link.updated_at.map(to_millis),
            ],
        )
        .map_err(map_sqerr)?;
        write_rules(&tx, link.code.as_str(), &link.rules)?;
        tx.commit().map_err(map_sqerr)
    }

    fn update_link(&self, link: &Link) -> Result<(), CoreError> {
        let mut conn = self.lock()?;
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(map_sqerr)?;
        let changed = tx
            .execute(
                "UPDATE links SET destination = ?1, title = ?2, description = ?3, monetizable = ?4, suspended = ?5, updated_at = ?6 WHERE code = ?7",
                params![
                    link.destination,
                    link.title,
                    link.description,
                    link.monetizable as i64,
                    link.suspended as i64,
                    link.updated_at.map(to_millis),
                    link.code.as_str(),
                ],
            )
            .map_err(map_sqerr)?;
        if changed == 0 {
            return Err(CoreError::NotFound);
        }
        write_rules(&tx, link.code.as_str(), &link.rules)?;
        tx.commit().map_err(map_sqerr)
    }

    fn list_links_by_owner(&self, owner: &UserId, limit: usize) -> Result<Vec<Link>, CoreError> {
        let conn = self.lock()?;
        let sql = format!(
            "SELECT {LINK_COLUMNS} FROM links WHERE owner = ?1 ORDER BY created_at DESC, code LIMIT ?2"
        );
        let mut stmt = conn.prepare(&sql).map_err(map_sqerr)?;
        let mut rows = stmt
            .query(params![owner.as_str(), limit as i64])
            .map_err(map_sqerr)?;
        let mut out = Vec::new();
        while let Some(row) = rows.next().map_err(map_sqerr)? {
            out.push(row_to_link(row)?);
        }
        for link in &mut out {
            link.rules = load_rules(&conn, link.code.as_str())?;
        }
        Ok(out)
    }
}

const USER_COLUMNS: &str = "id, status, generated_earnings, paid_out, custom_rate, created_at";

fn row_to_user(row: &Row) -> Result<User, CoreError> {
    let id: String = row.get(0).map_err(map_sqerr)?;
    let status: String = row.get(1).map_err(map_sqerr)?;
    let custom: Option<i64> = row.get(4).map_err(map_sqerr)?;
    Ok(User {
        id: UserId::new(id).map_err(|_| bad_row("user id"))?,
        status: AccountStatus::parse(&status).ok_or_else(|| bad_row("account status"))?,
        generated_earnings: money_from_sql(row.get(2).map_err(map_sqerr)?)?,
        paid_out: money_from_sql(row.get(3).map_err(map_sqerr)?)?,
        custom_rate: custom.map(money_from_sql).transpose()?,
        created_at: from_millis(row.get(5).map_err(map_sqerr)?),
    })
}

fn get_user_on(conn: &Connection, id: &str) -> Result<Option<User>, CoreError> {
    let sql = format!("SELECT {USER_COLUMNS} FROM users WHERE id = ?1");
    let mut stmt = conn.prepare(&sql).map_err(map_sqerr)?;
    let mut rows = stmt.query(params![id]).map_err(map_sqerr)?;
    match rows.next().map_err(map_sqerr)? {
        Some(row) => Ok(Some(row_to_user(row)?)),
        None => Ok(None),
    }
}

impl SqliteStore {
    /// Run a single-row user update and return the fresh row.
    fn update_user(
        &self,
        id: &UserId,
        sql: &str,
        value: Option<rusqlite::types::Value>,
    ) -> Result<User, CoreError> {
        let mut conn = self.lock()?;
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(map_sqerr)?;
        let changed = tx
            .execute(sql, params![value, id.as_str()])
            .map_err(map_sqerr)?;
        if changed == 0 {
            return Err(CoreError::NotFound);
        }
        let user = get_user_on(&tx, id.as_str())?.ok_or(CoreError::NotFound)?;
        tx.commit().map_err(map_sqerr)?;
        Ok(user)
    }
}

impl UserRepository for SqliteStore {
    fn get_user(&self, id: &UserId) -> Result<Option<User>, CoreError> {
        let conn = self.lock()?;
        get_user_on(&conn, id.as_str())
    }

    fn insert_user(&self, user: User) -> Result<(), CoreError> {
        let conn = self.lock()?;
        conn.execute(
            &format!("INSERT INTO users({USER_COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6)"),
            params![
                user.id.as_str(),
                user.status.as_str(),
                money_to_sql(user.generated_earnings)?,
                money_to_sql(user.paid_out)?,
                user.custom_rate.map(money_to_sql).transpose()?,
                to_millis(user.created_at),
            ],
        )
        .map_err(map_sqerr)?;
        Ok(())
    }

    fn set_custom_rate(&self, id: &UserId, rate: Option<Money>) -> Result<User, CoreError> {
        let value = rate
            .map(money_to_sql)
            .transpose()?
            .map(rusqlite::types::Value::Integer);
        self.update_user(id, "UPDATE users SET custom_rate = ?1 WHERE id = ?2", value)
    }

    fn set_account_status(&self, id: &UserId, status: AccountStatus) -> Result<User, CoreError> {
        let value = rusqlite::types::Value::Text(status.as_str().to_string());
        self.update_user(id, "UPDATE users SET status = ?1 WHERE id = ?2", Some(value))
    }

    fn record_payout(&self, id: &UserId, amount: Money) -> Result<User, CoreError> {
        let mut conn = self.lock()?;
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(map_sqerr)?;
        let user = get_user_on(&tx, id.as_str())?.ok_or(CoreError::NotFound)?;
        let paid = add(user.paid_out, amount)?;
        if paid > user.generated_earnings {
            return Err(CoreError::InvalidState(
                "payout exceeds generated earnings".into(),
            ));
        }
        tx.execute(
            "UPDATE users SET paid_out = ?1 WHERE id = ?2",
            params![money_to_sql(paid)?, id.as_str()],
        )
        .map_err(map_sqerr)?;
        tx.commit().map_err(map_sqerr)?;
        Ok(User {
            paid_out: paid,
            ..user
        })
    }
}

fn row_to_period(row: &Row) -> Result<RatePeriod, CoreError> {
    let ends_at: Option<i64> = row.get(3).map_err(map_sqerr)?;
    Ok(RatePeriod {
        id: RatePeriodId(row.get::<_, i64>(0).map_err(map_sqerr)? as u64),
        rate: money_from_sql(row.get(1).map_err(map_sqerr)?)?,
        starts_at: from_millis(row.get(2).map_err(map_sqerr)?),
        ends_at: ends_at.map(from_millis),
    })
}

impl RateRepository for SqliteStore {
    fn list_rate_periods(&self) -> Result<Vec<RatePeriod>, CoreError> {
        let conn = self.lock()?;
        let mut stmt = conn
            .prepare("SELECT id, rate, starts_at, ends_at FROM rate_periods ORDER BY starts_at, id")
            .map_err(map_sqerr)?;
        let mut rows = stmt.query([]).map_err(map_sqerr)?;
        let mut out = Vec::new();
        while let Some(row) = rows.next().map_err(map_sqerr)? {
            out.push(row_to_period(row)?);
        }
        Ok(out)
    }

    fn find_rate_period(&self, as_of: SystemTime) -> Result<Option<RatePeriod>, CoreError> {
        let conn = self.lock()?;
        let mut stmt = conn
            .prepare(
                "SELECT id, rate, starts_at, ends_at FROM rate_periods \
                 WHERE starts_at <= ?1 AND (ends_at IS NULL OR ?1 < ends_at) \
                 ORDER BY starts_at DESC LIMIT 1",
            )
            .map_err(map_sqerr)?;
        let mut rows = stmt.query(params![to_millis(as_of)]).map_err(map_sqerr)?;
        match rows.next().map_err(map_sqerr)? {
            Some(row) => Ok(Some(row_to_period(row)?)),
            None => Ok(None),
        }
    }

    fn open_rate_period(&self, rate: Money, at: SystemTime) -> Result<RatePeriod, CoreError> {
        let mut at_ms = to_millis(at);
        let mut conn = self.lock()?;
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(map_sqerr)?;
        let open_start: Option<i64> = tx
            .query_row(
                "SELECT starts_at FROM rate_periods WHERE ends_at IS NULL",
                [],
                |row| row.get(0),
            )
            .optional()
            .map_err(map_sqerr)?;
        if let Some(start) = open_start {
            // Later than the open period but inside its millisecond: start the
            // new one on the next millisecond.
            if at_ms == start && at > from_millis(start) {
                at_ms = start + 1;
            }
            if at_ms <= start {
                return Err(CoreError::InvalidState(
                    "new rate period must start after the open one".into(),
                ));
            }
            tx.execute(
                "UPDATE rate_periods SET ends_at = ?1 WHERE ends_at IS NULL",
                params![at_ms],
            )
            .map_err(map_sqerr)?;
        }
        tx.execute(
            "INSERT INTO rate_periods(rate, starts_at, ends_at) VALUES (?1, ?2, NULL)",
            params![money_to_sql(rate)?, at_ms],
        )
        .map_err(|e| match map_sqerr(e) {
            // The open-period index rejected a second open row.
            CoreError::AlreadyExists => CoreError::Conflict("another rate period is open".into()),
            other => other,
        })?;
        let id = tx.last_insert_rowid();
        tx.commit().map_err(map_sqerr)?;
        Ok(RatePeriod {
            id: RatePeriodId(id as u64),
            rate,
            starts_at: from_millis(at_ms),
            ends_at: None,
        })
    }
}

const CLICK_COLUMNS: &str = "id, code, clicked_at, requester_key, client_token, client_first_use, server_unique, billable, rate_applied, amount, reason, processed, processed_at";

fn row_to_click(row: &Row) -> Result<ClickEvent, CoreError> {
    let code: String = row.get(1).map_err(map_sqerr)?;
    let requester: Option<String> = row.get(3).map_err(map_sqerr)?;
    let rate: Option<i64> = row.get(8).map_err(map_sqerr)?;
    let reason: Option<String> = row.get(10).map_err(map_sqerr)?;
    let processed_at: Option<i64> = row.get(12).map_err(map_sqerr)?;
    Ok(ClickEvent {
        id: ClickId(row.get::<_, i64>(0).map_err(map_sqerr)? as u64),
        link: ShortCode::new(code).map_err(|_| bad_row("code"))?,
        clicked_at: from_millis(row.get(2).map_err(map_sqerr)?),
        requester_key: requester.and_then(RequesterKey::new),
        client_token: row.get(4).map_err(map_sqerr)?,
        client_first_use: row.get::<_, i64>(5).map_err(map_sqerr)? != 0,
        server_unique: row.get::<_, i64>(6).map_err(map_sqerr)? != 0,
        billable: row.get::<_, i64>(7).map_err(map_sqerr)? != 0,
        rate_applied: rate.map(money_from_sql).transpose()?,
        amount: money_from_sql(row.get(9).map_err(map_sqerr)?)?,
        reason: reason
            .map(|r| SettleReason::parse(&r).ok_or_else(|| bad_row("settle reason")))
            .transpose()?,
        processed: row.get::<_, i64>(11).map_err(map_sqerr)? != 0,
        processed_at: processed_at.map(from_millis),
    })
}

fn get_click_on(conn: &Connection, id: ClickId) -> Result<Option<ClickEvent>, CoreError> {
    let sql = format!("SELECT {CLICK_COLUMNS} FROM click_events WHERE id = ?1");
    let mut stmt = conn.prepare(&sql).map_err(map_sqerr)?;
    let mut rows = stmt.query(params![id.0 as i64]).map_err(map_sqerr)?;
    match rows.next().map_err(map_sqerr)? {
        Some(row) => Ok(Some(row_to_click(row)?)),
        None => Ok(None),
    }
}

fn collect_clicks(mut rows: rusqlite::Rows<'_>) -> Result<Vec<ClickEvent>, CoreError> {
    let mut out = Vec::new();
    while let Some(row) = rows.next().map_err(map_sqerr)? {
        out.push(row_to_click(row)?);
    }
    Ok(out)
}

impl ClickRepository for SqliteStore {
    fn record_click(
        &self,
        click: NewClick,
        dedup_since: SystemTime,
    ) -> Result<ClickEvent, CoreError> {
        let mut conn = self.lock()?;
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(map_sqerr)?;
        let code = click.link.as_str().to_string();
        let bumped = tx
            .execute(
                "UPDATE links SET total_clicks = total_clicks + 1 WHERE code = ?1",
                params![code],
            )
            .map_err(map_sqerr)?;
        if bumped == 0 {
            return Err(CoreError::NotFound);
        }
        // Same predicate as `domain::clicks::same_requester`: key or token match.
        let key = click.signals.requester_key.as_ref().map(|k| k.as_str().to_string());
        let seen: bool = tx
            .query_row(
                "SELECT EXISTS(SELECT 1 FROM click_events WHERE code = ?1 AND clicked_at >= ?2 \
                 AND ((?3 IS NOT NULL AND requester_key = ?3) OR (?4 IS NOT NULL AND client_token = ?4)))",
                params![code, to_millis(dedup_since), key, click.signals.client_token],
                |row| row.get(0),
            )
            .map_err(map_sqerr)?;
        let clicked_at = to_millis(click.clicked_at);
        tx.execute(
            "INSERT INTO click_events(code, clicked_at, requester_key, client_token, client_first_use, server_unique) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                code,
                clicked_at,
                key,
                click.signals.client_token,
                click.signals.client_first_use as i64,
                (!seen) as i64,
            ],
        )
        .map_err(map_sqerr)?;
        let id = ClickId(tx.last_insert_rowid() as u64);
        tx.commit().map_err(map_sqerr)?;
        let mut event = ClickEvent::pending(id, click, !seen);
        event.clicked_at = from_millis(clicked_at);
        Ok(event)
    }

    fn get_click(&self, id: ClickId) -> Result<Option<ClickEvent>, CoreError> {
        let conn = self.lock()?;
        get_click_on(&conn, id)
    }

    fn list_unprocessed(
        &self,
        after: Option<ClickId>,
        limit: usize,
    ) -> Result<Vec<ClickEvent>, CoreError> {
        let conn = self.lock()?;
        let sql = format!(
            "SELECT {CLICK_COLUMNS} FROM click_events WHERE processed = 0 AND id > ?1 ORDER BY id LIMIT ?2"
        );
        let mut stmt = conn.prepare(&sql).map_err(map_sqerr)?;
        let rows = stmt
            .query(params![after.map_or(0, |id| id.0 as i64), limit as i64])
            .map_err(map_sqerr)?;
        collect_clicks(rows)
    }

    fn list_clicks(
        &self,
        code: &ShortCode,
        since: SystemTime,
        limit: usize,
    ) -> Result<Vec<ClickEvent>, CoreError> {
        let conn = self.lock()?;
        let sql = format!(
            "SELECT {CLICK_COLUMNS} FROM click_events WHERE code = ?1 AND clicked_at >= ?2 ORDER BY clicked_at DESC, id DESC LIMIT ?3"
        );
        let mut stmt = conn.prepare(&sql).map_err(map_sqerr)?;
        let rows = stmt
            .query(params![code.as_str(), to_millis(since), limit as i64])
            .map_err(map_sqerr)?;
        collect_clicks(rows)
    }
}

impl SettlementRepository for SqliteStore {
    fn apply_settlement(&self, s: &Settlement) -> Result<SettlementApplied, CoreError> {
        let mut conn = self.lock()?;
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(map_sqerr)?;
        let click = get_click_on(&tx, s.click_id)?.ok_or(CoreError::NotFound)?;
        if click.processed {
            return Ok(SettlementApplied::AlreadyProcessed(click));
        }
        if s.billable {
            let owner = s.owner.as_ref().ok_or(CoreError::NotFound)?;
            let link = get_link_on(&tx, s.link.as_str())?.ok_or(CoreError::NotFound)?;
            let user = get_user_on(&tx, owner.as_str())?.ok_or(CoreError::NotFound)?;
            if !still_billable(&link, &user, &click) {
                return Err(CoreError::Conflict("billing state changed".into()));
            }
        }

        let changed = tx
            .execute(
                "UPDATE click_events SET billable = ?1, rate_applied = ?2, amount = ?3, reason = ?4, processed = 1, processed_at = ?5 \
                 WHERE id = ?6 AND processed = 0",
                params![
                    s.billable as i64,
                    s.rate_applied.map(money_to_sql).transpose()?,
                    money_to_sql(s.amount)?,
                    s.reason.as_str(),
                    to_millis(s.processed_at),
                    s.click_id.0 as i64,
                ],
            )
            .map_err(map_sqerr)?;
        if changed == 0 {
            return Err(CoreError::Conflict("click settled concurrently".into()));
        }

        let mut crossed = None;
        if s.billable {
            let owner = s.owner.as_ref().ok_or(CoreError::NotFound)?;
            let (real, reached, link_total): (i64, i64, i64) = tx
                .query_row(
                    "SELECT real_clicks, milestones_reached, generated_earnings FROM links WHERE code = ?1",
                    params![s.link.as_str()],
                    |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
                )
                .optional()
                .map_err(map_sqerr)?
                .ok_or(CoreError::NotFound)?;
            let user_total: i64 = tx
                .query_row(
                    "SELECT generated_earnings FROM users WHERE id = ?1",
                    params![owner.as_str()],
                    |row| row.get(0),
                )
                .optional()
                .map_err(map_sqerr)?
                .ok_or(CoreError::NotFound)?;

            let real = real as u64 + 1;
            let mut reached = reached as u64;
            crossed = milestone_crossed(real, reached, s.milestone_step);
            if let Some(m) = crossed {
                reached = m / s.milestone_step;
            }
            tx.execute(
                "UPDATE links SET real_clicks = ?1, generated_earnings = ?2, milestones_reached = ?3 WHERE code = ?4",
                params![
                    real as i64,
                    money_to_sql(add(money_from_sql(link_total)?, s.amount)?)?,
                    reached as i64,
                    s.link.as_str(),
                ],
            )
            .map_err(map_sqerr)?;
            tx.execute(
                "UPDATE users SET generated_earnings = ?1 WHERE id = ?2",
                params![
                    money_to_sql(add(money_from_sql(user_total)?, s.amount)?)?,
                    owner.as_str(),
                ],
            )
            .map_err(map_sqerr)?;
        }
        tx.commit().map_err(map_sqerr)?;
        Ok(SettlementApplied::Applied {
            crossed_milestone: crossed,
        })
    }
}

const SPONSOR_COLUMNS: &str = "id, code, sponsor_url, active, expires_at, views, clicks, created_at";

fn row_to_sponsor(row: &Row) -> Result<SponsorRule, CoreError> {
    let code: String = row.get(1).map_err(map_sqerr)?;
    let expires_at: Option<i64> = row.get(4).map_err(map_sqerr)?;
    Ok(SponsorRule {
        id: row.get(0).map_err(map_sqerr)?,
        link: ShortCode::new(code).map_err(|_| bad_row("code"))?,
        sponsor_url: row.get(2).map_err(map_sqerr)?,
        active: row.get::<_, i64>(3).map_err(map_sqerr)? != 0,
        expires_at: expires_at.map(from_millis),
        views: row.get::<_, i64>(5).map_err(map_sqerr)? as u64,
        clicks: row.get::<_, i64>(6).map_err(map_sqerr)? as u64,
        created_at: from_millis(row.get(7).map_err(map_sqerr)?),
    })
}

impl SqliteStore {
    fn bump_sponsor(&self, id: &str, column: &str) -> Result<(), CoreError> {
        let conn = self.lock()?;
        let changed = conn
            .execute(
                &format!("UPDATE sponsor_rules SET {column} = {column} + 1 WHERE id = ?1"),
                params![id],
            )
            .map_err(map_sqerr)?;
        if changed == 0 {
            Err(CoreError::NotFound)
        } else {
            Ok(())
        }
    }
}

impl SponsorRepository for SqliteStore {
    fn insert_sponsor(&self, sponsor: SponsorRule) -> Result<(), CoreError> {
        let conn = self.lock()?;
        conn.execute(
            &format!("INSERT INTO sponsor_rules({SPONSOR_COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)"),
            params![
                sponsor.id,
                sponsor.link.as_str(),
                sponsor.sponsor_url,
                sponsor.active as i64,
                sponsor.expires_at.map(to_millis),
                sponsor.views as i64,
                sponsor.clicks as i64,
                to_millis(sponsor.created_at),
            ],
        )
        .map_err(map_sqerr)?;
        Ok(())
    }

    fn get_sponsor(&self, id: &str) -> Result<Option<SponsorRule>, CoreError> {
        let conn = self.lock()?;
        let sql = format!("SELECT {SPONSOR_COLUMNS} FROM sponsor_rules WHERE id = ?1");
        let mut stmt = conn.prepare(&sql).map_err(map_sqerr)?;
        let mut rows = stmt.query(params![id]).map_err(map_sqerr)?;
        match rows.next().map_err(map_sqerr)? {
            Some(row) => Ok(Some(row_to_sponsor(row)?)),
            None => Ok(None),
        }
    }

    fn list_sponsors(&self, code: &ShortCode) -> Result<Vec<SponsorRule>, CoreError> {
        let conn = self.lock()?;
        let sql = format!(
            "SELECT {SPONSOR_COLUMNS} FROM sponsor_rules WHERE code = ?1 ORDER BY created_at, id"
        );
        let mut stmt = conn.prepare(&sql).map_err(map_sqerr)?;
        let mut rows = stmt.query(params![code.as_str()]).map_err(map_sqerr)?;
        let mut out = Vec::new();
        while let Some(row) = rows.next().map_err(map_sqerr)? {
            out.push(row_to_sponsor(row)?);
        }
        Ok(out)
    }

    fn record_sponsor_view(&self, id: &str) -> Result<(), CoreError> {
        self.bump_sponsor(id, "views")
    }

    fn record_sponsor_click(&self, id: &str) -> Result<(), CoreError> {
        self.bump_sponsor(id, "clicks")
    }
}
