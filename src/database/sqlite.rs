use crate::database::{
    credit_delta, int, uint, AuditEntry, Database, Event, EventStatus, Listing, Mint, NewEvent,
    NewTicketType, Origin, Outcome, Purchase, Resale, RevenueShare, Role, Ticket, TicketState,
    TicketType, TicketTypeUpdate, Transaction, TransactionKind, Usage, User,
};
use anyhow::{Context, Result};
use futures::{
    future::{self, BoxFuture},
    FutureExt,
};
use rusqlite::{params, Connection, OpenFlags, Params, Row};
use std::{
    env,
    sync::{Mutex, MutexGuard},
};
use url::Url;

pub struct Sqlite {
    connection: Mutex<Connection>,
}

impl Sqlite {
    pub fn new(connection: Connection) -> Result<Self> {
        connection
            .execute_batch(SCHEMA)
            .context("create schema")?;
        Ok(Self {
            connection: Mutex::new(connection),
        })
    }

    /// Opens a new SQLite database backend for the specified URL. The expected
    /// URL format is `sqlite://[/path[?query]]`. For example:
    ///
    /// - `sqlite://` to open and in-memory connection
    /// - `sqlite:///relative/foo.db` to open the file `relative/foo.db`
    /// - `sqlite:////absolute/foo.db` to open the file `/absolute/foo.db`
    ///
    /// Additionally, query string parameters can be set to configure database
    /// connection options. See <https://www.sqlite.org/uri.html> for supported
    /// query string parameters.
    pub fn open(url: &Url) -> Result<Self> {
        anyhow::ensure!(url.scheme() == "sqlite", "not an sqlite:// URL");
        anyhow::ensure!(
            url.has_authority() && url.authority() == "",
            "sqlite:// URL requires empty authority"
        );
        anyhow::ensure!(
            url.fragment().is_none(),
            "sqlite:// URL does not support fragments"
        );

        if url.path().is_empty() {
            tracing::debug!("opening in-memory database");
            return Self::new(Connection::open_in_memory()?);
        };

        // SQLite 3 supports connection strings as file:// URLs, convert our
        // `sqlite://` to that.
        let relative = url
            .path()
            .strip_prefix('/')
            .context("sqlite:// URL path not prefixed with /")?;
        let path = env::current_dir()?.join(relative);
        let mut file = Url::from_file_path(path)
            .ok()
            .context("invalid sqlite:// URL file path")?;
        if let Some(query) = url.query() {
            file.set_query(Some(query));
        }

        tracing::debug!("opening database {file}");
        let connection = Connection::open_with_flags(
            file.as_str(),
            OpenFlags::default() | OpenFlags::SQLITE_OPEN_URI,
        )?;

        Self::new(connection)
    }

    #[cfg(test)]
    /// Create a temporary in memory database for tests.
    pub fn new_for_test() -> Self {
        Self::new(Connection::open_in_memory().unwrap()).unwrap()
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>> {
        self.connection
            .lock()
            .map_err(|_| anyhow::anyhow!("sqlite connection poisoned"))
    }

    /// Runs `f` in a transaction that is committed only if `f` succeeds.
    fn write<T>(&self, f: impl FnOnce(&Connection) -> Result<T>) -> Result<T> {
        let mut connection = self.lock()?;
        let transaction = connection.transaction().context("transaction")?;
        let result = f(&transaction)?;
        transaction.commit().context("commit")?;
        Ok(result)
    }

    fn read<T>(&self, f: impl FnOnce(&Connection) -> Result<T>) -> Result<T> {
        f(&*self.lock()?)
    }
}

// rusqlite is blocking but every statement here is short, so the futures are
// computed eagerly.
impl Database for Sqlite {
    fn create_event<'a>(
        &'a self,
        event: &'a NewEvent,
        shares: &'a [RevenueShare],
        origin: &'a Origin,
    ) -> BoxFuture<'a, Result<Outcome>> {
        future::ready(self.write(|con| create_event(con, event, shares, origin))).boxed()
    }

    fn set_event_status<'a>(
        &'a self,
        event_id: u64,
        status: EventStatus,
        creator: &'a str,
        origin: &'a Origin,
    ) -> BoxFuture<'a, Result<Outcome>> {
        future::ready(self.write(|con| set_event_status(con, event_id, status, creator, origin)))
            .boxed()
    }

    fn add_ticket_type<'a>(
        &'a self,
        ticket_type: &'a NewTicketType,
        origin: &'a Origin,
    ) -> BoxFuture<'a, Result<Outcome>> {
        future::ready(self.write(|con| add_ticket_type(con, ticket_type, origin))).boxed()
    }

    fn update_ticket_type<'a>(
        &'a self,
        update: &'a TicketTypeUpdate,
        origin: &'a Origin,
    ) -> BoxFuture<'a, Result<Outcome>> {
        future::ready(self.write(|con| update_ticket_type(con, update, origin))).boxed()
    }

    fn mint_ticket<'a>(
        &'a self,
        mint: &'a Mint,
        origin: &'a Origin,
    ) -> BoxFuture<'a, Result<Outcome>> {
        future::ready(self.write(|con| mint_ticket(con, mint, origin))).boxed()
    }

    fn record_purchase<'a>(
        &'a self,
        purchase: &'a Purchase,
        origin: &'a Origin,
    ) -> BoxFuture<'a, Result<Outcome>> {
        future::ready(self.write(|con| record_purchase(con, purchase, origin))).boxed()
    }

    fn list_ticket<'a>(
        &'a self,
        listing: &'a Listing,
        origin: &'a Origin,
    ) -> BoxFuture<'a, Result<Outcome>> {
        future::ready(self.write(|con| list_ticket(con, listing, origin))).boxed()
    }

    fn resell_ticket<'a>(
        &'a self,
        resale: &'a Resale,
        origin: &'a Origin,
    ) -> BoxFuture<'a, Result<Outcome>> {
        future::ready(self.write(|con| resell_ticket(con, resale, origin))).boxed()
    }

    fn cancel_listing<'a>(
        &'a self,
        ticket_id: u64,
        origin: &'a Origin,
    ) -> BoxFuture<'a, Result<Outcome>> {
        future::ready(self.write(|con| cancel_listing(con, ticket_id, origin))).boxed()
    }

    fn use_ticket<'a>(
        &'a self,
        usage: &'a Usage,
        origin: &'a Origin,
    ) -> BoxFuture<'a, Result<Outcome>> {
        future::ready(self.write(|con| use_ticket(con, usage, origin))).boxed()
    }

    fn checkpoint(&self) -> BoxFuture<'_, Result<Option<u64>>> {
        future::ready(self.read(|con| {
            query_row(con, GET_CHECKPOINT, params![], |row| uint(row.get(0)?, "checkpoint"))
        }))
        .boxed()
    }

    fn latest_transaction_block(&self) -> BoxFuture<'_, Result<Option<u64>>> {
        future::ready(self.read(|con| {
            let block: Option<i64> = con
                .prepare_cached(LATEST_TRANSACTION_BLOCK)?
                .query_row(params![], |row| row.get(0))
                .context("query LATEST_TRANSACTION_BLOCK")?;
            block.map(|block| uint(block, "block")).transpose()
        }))
        .boxed()
    }

    fn advance_checkpoint(&self, block: u64) -> BoxFuture<'_, Result<u64>> {
        future::ready(self.write(|con| {
            con.prepare_cached(ADVANCE_CHECKPOINT)?
                .execute(params![int(block, "checkpoint")?])
                .context("execute ADVANCE_CHECKPOINT")?;
            let stored: i64 = con
                .prepare_cached(GET_CHECKPOINT)?
                .query_row(params![], |row| row.get(0))
                .context("query GET_CHECKPOINT")?;
            uint(stored, "checkpoint")
        }))
        .boxed()
    }

    fn scan_cursor<'a>(&'a self, event: &'a str) -> BoxFuture<'a, Result<Option<u64>>> {
        future::ready(self.read(|con| {
            query_row(con, GET_SCAN_CURSOR, params![event], |row| {
                uint(row.get(0)?, "scan cursor")
            })
        }))
        .boxed()
    }

    fn set_scan_cursor<'a>(&'a self, event: &'a str, block: u64) -> BoxFuture<'a, Result<()>> {
        future::ready(self.write(|con| {
            con.prepare_cached(SET_SCAN_CURSOR)?
                .execute(params![event, int(block, "scan cursor")?])
                .context("execute SET_SCAN_CURSOR")?;
            Ok(())
        }))
        .boxed()
    }

    fn event(&self, event_id: u64) -> BoxFuture<'_, Result<Option<Event>>> {
        future::ready(self.read(|con| {
            query_row(con, GET_EVENT, params![int(event_id, "event id")?], event_row)
        }))
        .boxed()
    }

    fn events_by_creator<'a>(&'a self, creator: &'a str) -> BoxFuture<'a, Result<Vec<Event>>> {
        let creator = creator.to_ascii_lowercase();
        future::ready(
            self.read(|con| query_rows(con, EVENTS_BY_CREATOR, params![creator], event_row)),
        )
        .boxed()
    }

    fn ticket_types(&self, event_id: u64) -> BoxFuture<'_, Result<Vec<TicketType>>> {
        future::ready(self.read(|con| {
            query_rows(
                con,
                TICKET_TYPES,
                params![int(event_id, "event id")?],
                ticket_type_row,
            )
        }))
        .boxed()
    }

    fn ticket_type(
        &self,
        event_id: u64,
        type_id: u64,
    ) -> BoxFuture<'_, Result<Option<TicketType>>> {
        future::ready(self.read(|con| {
            query_row(
                con,
                GET_TICKET_TYPE,
                params![int(event_id, "event id")?, int(type_id, "type id")?],
                ticket_type_row,
            )
        }))
        .boxed()
    }

    fn ticket(&self, ticket_id: u64) -> BoxFuture<'_, Result<Option<Ticket>>> {
        future::ready(self.read(|con| {
            query_row(con, GET_TICKET, params![int(ticket_id, "ticket id")?], ticket_row)
        }))
        .boxed()
    }

    fn user<'a>(&'a self, address: &'a str) -> BoxFuture<'a, Result<Option<User>>> {
        let address = address.to_ascii_lowercase();
        future::ready(self.read(|con| query_row(con, GET_USER, params![address], user_row))).boxed()
    }

    fn user_tickets<'a>(&'a self, owner: &'a str) -> BoxFuture<'a, Result<Vec<Ticket>>> {
        let owner = owner.to_ascii_lowercase();
        future::ready(self.read(|con| query_rows(con, USER_TICKETS, params![owner], ticket_row)))
            .boxed()
    }

    fn resale_listings(&self, event_id: Option<u64>) -> BoxFuture<'_, Result<Vec<Ticket>>> {
        future::ready(self.read(|con| {
            let event_id = event_id.map(|id| int(id, "event id")).transpose()?;
            query_rows(con, RESALE_LISTINGS, params![event_id], ticket_row)
        }))
        .boxed()
    }

    fn purchase_tickets<'a>(&'a self, tx_hash: &'a str) -> BoxFuture<'a, Result<Vec<Ticket>>> {
        let tx_hash = tx_hash.to_ascii_lowercase();
        future::ready(
            self.read(|con| query_rows(con, PURCHASE_TICKETS, params![tx_hash], ticket_row)),
        )
        .boxed()
    }

    fn user_transactions<'a>(
        &'a self,
        address: &'a str,
    ) -> BoxFuture<'a, Result<Vec<Transaction>>> {
        let address = address.to_ascii_lowercase();
        future::ready(self.read(|con| {
            query_rows(con, USER_TRANSACTIONS, params![address], transaction_row)
        }))
        .boxed()
    }

    fn transactions_by_kind(
        &self,
        kind: TransactionKind,
    ) -> BoxFuture<'_, Result<Vec<Transaction>>> {
        future::ready(self.read(|con| {
            query_rows(
                con,
                TRANSACTIONS_BY_KIND,
                params![kind.as_str()],
                transaction_row,
            )
        }))
        .boxed()
    }

    fn revenue_shares(&self, event_id: u64) -> BoxFuture<'_, Result<Vec<RevenueShare>>> {
        future::ready(self.read(|con| {
            query_rows(
                con,
                REVENUE_SHARES,
                params![int(event_id, "event id")?],
                |row| {
                    Ok(RevenueShare {
                        beneficiary: row.get(0)?,
                        percentage: uint(row.get(1)?, "percentage")?,
                    })
                },
            )
        }))
        .boxed()
    }
}

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS users(address TEXT PRIMARY KEY NOT NULL, role TEXT NOT NULL, created_block INTEGER NOT NULL) STRICT;
CREATE TABLE IF NOT EXISTS events(event_id INTEGER PRIMARY KEY NOT NULL, creator TEXT NOT NULL, name TEXT NOT NULL, event_uri TEXT NOT NULL, document_uri TEXT NOT NULL, event_date INTEGER NOT NULL, event_active INTEGER NOT NULL, status TEXT NOT NULL, created_at INTEGER NOT NULL, approved_at INTEGER, tx_hash TEXT NOT NULL, block_number INTEGER NOT NULL) STRICT;
CREATE INDEX IF NOT EXISTS events_creator ON events(creator);
CREATE TABLE IF NOT EXISTS revenue_shares(event_id INTEGER NOT NULL, beneficiary TEXT NOT NULL, percentage INTEGER NOT NULL, PRIMARY KEY(event_id, beneficiary)) STRICT;
CREATE TABLE IF NOT EXISTS ticket_types(event_id INTEGER NOT NULL, type_id INTEGER NOT NULL, name TEXT NOT NULL, price TEXT NOT NULL, total_supply INTEGER NOT NULL, sold INTEGER NOT NULL, sale_start INTEGER NOT NULL, sale_end INTEGER NOT NULL, active INTEGER NOT NULL, updated_block INTEGER NOT NULL, updated_log_index INTEGER NOT NULL, PRIMARY KEY(event_id, type_id)) STRICT;
CREATE TABLE IF NOT EXISTS tickets(ticket_id INTEGER PRIMARY KEY NOT NULL, event_id INTEGER NOT NULL, type_id INTEGER NOT NULL, owner TEXT NOT NULL, is_used INTEGER NOT NULL DEFAULT 0, used_at INTEGER, minted_at INTEGER NOT NULL, is_for_resale INTEGER NOT NULL DEFAULT 0, resale_price TEXT, resale_deadline INTEGER, resale_count INTEGER NOT NULL DEFAULT 0, tx_hash TEXT NOT NULL, owner_block INTEGER NOT NULL, owner_log_index INTEGER NOT NULL, listing_block INTEGER NOT NULL, listing_log_index INTEGER NOT NULL, used_block INTEGER, used_log_index INTEGER) STRICT;
CREATE INDEX IF NOT EXISTS tickets_owner ON tickets(owner);
CREATE INDEX IF NOT EXISTS tickets_tx_hash ON tickets(tx_hash);
CREATE TABLE IF NOT EXISTS transactions(tx_hash TEXT NOT NULL, log_index INTEGER NOT NULL, kind TEXT NOT NULL, sender TEXT, recipient TEXT, amount TEXT NOT NULL, event_id INTEGER, ticket_id INTEGER, block_number INTEGER NOT NULL, timestamp INTEGER NOT NULL, PRIMARY KEY(tx_hash, log_index)) STRICT;
CREATE INDEX IF NOT EXISTS transactions_block ON transactions(block_number);
CREATE TABLE IF NOT EXISTS purchase_credits(tx_hash TEXT NOT NULL, event_id INTEGER NOT NULL, type_id INTEGER NOT NULL, minted INTEGER NOT NULL DEFAULT 0, purchased INTEGER NOT NULL DEFAULT 0, credited INTEGER NOT NULL DEFAULT 0, PRIMARY KEY(tx_hash, event_id, type_id)) STRICT;
CREATE TABLE IF NOT EXISTS _checkpoint(id INTEGER PRIMARY KEY NOT NULL CHECK(id = 0), block INTEGER NOT NULL) STRICT;
CREATE TABLE IF NOT EXISTS _scan_cursor(event TEXT PRIMARY KEY NOT NULL, block INTEGER NOT NULL) STRICT;
";

const UPSERT_USER: &str = "INSERT INTO users(address, role, created_block) VALUES(?1, ?2, ?3) ON CONFLICT(address) DO NOTHING;";
const INSERT_TRANSACTION: &str = "INSERT INTO transactions(tx_hash, log_index, kind, sender, recipient, amount, event_id, ticket_id, block_number, timestamp) VALUES(?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10) ON CONFLICT(tx_hash, log_index) DO NOTHING;";

const INSERT_EVENT: &str = "INSERT INTO events(event_id, creator, name, event_uri, document_uri, event_date, event_active, status, created_at, tx_hash, block_number) VALUES(?1, ?2, ?3, ?4, ?5, ?6, ?7, 'PENDING', ?8, ?9, ?10) ON CONFLICT(event_id) DO NOTHING;";
const INSERT_REVENUE_SHARE: &str = "INSERT INTO revenue_shares(event_id, beneficiary, percentage) VALUES(?1, ?2, ?3) ON CONFLICT(event_id, beneficiary) DO NOTHING;";
const SET_EVENT_STATUS: &str = "UPDATE events SET status = ?2, approved_at = COALESCE(?3, approved_at) WHERE event_id = ?1 AND status = 'PENDING';";
const GET_EVENT_STATUS: &str = "SELECT status FROM events WHERE event_id = ?1;";
const GET_EVENT_CREATOR: &str = "SELECT creator FROM events WHERE event_id = ?1;";
const ACTIVATE_EVENT: &str = "UPDATE events SET event_active = 1 WHERE event_id = ?1;";

const CREDITED_SOLD: &str = "SELECT COALESCE(SUM(credited), 0) FROM purchase_credits WHERE event_id = ?1 AND type_id = ?2;";
const INSERT_TICKET_TYPE: &str = "INSERT INTO ticket_types(event_id, type_id, name, price, total_supply, sold, sale_start, sale_end, active, updated_block, updated_log_index) VALUES(?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11) ON CONFLICT(event_id, type_id) DO NOTHING;";
const UPDATE_TICKET_TYPE: &str = "UPDATE ticket_types SET price = ?3, total_supply = ?4, sale_start = ?5, sale_end = ?6, active = ?7, updated_block = ?8, updated_log_index = ?9 WHERE event_id = ?1 AND type_id = ?2 AND (updated_block, updated_log_index) < (?8, ?9);";
const TICKET_TYPE_EXISTS: &str =
    "SELECT COUNT(*) > 0 FROM ticket_types WHERE event_id = ?1 AND type_id = ?2;";

const NEW_CREDIT: &str = "INSERT INTO purchase_credits(tx_hash, event_id, type_id) VALUES(?1, ?2, ?3) ON CONFLICT(tx_hash, event_id, type_id) DO NOTHING;";
const ADD_CREDIT: &str = "UPDATE purchase_credits SET minted = minted + ?4, purchased = purchased + ?5 WHERE tx_hash = ?1 AND event_id = ?2 AND type_id = ?3 RETURNING minted, purchased, credited;";
const SET_CREDITED: &str = "UPDATE purchase_credits SET credited = ?4 WHERE tx_hash = ?1 AND event_id = ?2 AND type_id = ?3;";
const ADD_SOLD: &str =
    "UPDATE ticket_types SET sold = sold + ?3 WHERE event_id = ?1 AND type_id = ?2;";

const INSERT_TICKET: &str = "INSERT INTO tickets(ticket_id, event_id, type_id, owner, minted_at, tx_hash, owner_block, owner_log_index, listing_block, listing_log_index) VALUES(?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?7, ?8) ON CONFLICT(ticket_id) DO NOTHING;";
const GET_TICKET_STATE: &str = "SELECT owner, used_block, used_log_index FROM tickets WHERE ticket_id = ?1;";
const LIST_TICKET: &str = "UPDATE tickets SET is_for_resale = 1, resale_price = ?2, resale_deadline = ?3, listing_block = ?4, listing_log_index = ?5 WHERE ticket_id = ?1 AND is_used = 0 AND (listing_block, listing_log_index) < (?4, ?5);";
const CLEAR_LISTING: &str = "UPDATE tickets SET is_for_resale = 0, resale_price = NULL, resale_deadline = NULL, listing_block = ?2, listing_log_index = ?3 WHERE ticket_id = ?1 AND is_used = 0 AND (listing_block, listing_log_index) < (?2, ?3);";
const TRANSFER_TICKET: &str = "UPDATE tickets SET owner = ?2, owner_block = ?3, owner_log_index = ?4 WHERE ticket_id = ?1 AND (owner_block, owner_log_index) < (?3, ?4);";
const COUNT_RESALE: &str =
    "UPDATE tickets SET resale_count = resale_count + 1 WHERE ticket_id = ?1;";
const USE_TICKET: &str = "UPDATE tickets SET is_used = 1, used_at = ?2, used_block = ?3, used_log_index = ?4, is_for_resale = 0, resale_price = NULL, resale_deadline = NULL WHERE ticket_id = ?1 AND is_used = 0;";

const GET_CHECKPOINT: &str = "SELECT block FROM _checkpoint WHERE id = 0;";
const ADVANCE_CHECKPOINT: &str = "INSERT INTO _checkpoint(id, block) VALUES(0, ?1) ON CONFLICT(id) DO UPDATE SET block = MAX(block, excluded.block);";
const LATEST_TRANSACTION_BLOCK: &str = "SELECT MAX(block_number) FROM transactions;";
const GET_SCAN_CURSOR: &str = "SELECT block FROM _scan_cursor WHERE event = ?1;";
const SET_SCAN_CURSOR: &str = "INSERT INTO _scan_cursor(event, block) VALUES(?1, ?2) ON CONFLICT(event) DO UPDATE SET block = MAX(block, excluded.block);";

const GET_EVENT: &str = "SELECT event_id, creator, name, event_uri, document_uri, event_date, event_active, status, created_at, approved_at, tx_hash, block_number FROM events WHERE event_id = ?1;";
const EVENTS_BY_CREATOR: &str = "SELECT event_id, creator, name, event_uri, document_uri, event_date, event_active, status, created_at, approved_at, tx_hash, block_number FROM events WHERE creator = ?1 ORDER BY event_id;";
const TICKET_TYPES: &str = "SELECT event_id, type_id, name, price, total_supply, sold, sale_start, sale_end, active FROM ticket_types WHERE event_id = ?1 ORDER BY type_id;";
const GET_TICKET_TYPE: &str = "SELECT event_id, type_id, name, price, total_supply, sold, sale_start, sale_end, active FROM ticket_types WHERE event_id = ?1 AND type_id = ?2;";
const GET_TICKET: &str = "SELECT ticket_id, event_id, type_id, owner, is_used, used_at, minted_at, is_for_resale, resale_price, resale_deadline, resale_count, tx_hash FROM tickets WHERE ticket_id = ?1;";
const USER_TICKETS: &str = "SELECT ticket_id, event_id, type_id, owner, is_used, used_at, minted_at, is_for_resale, resale_price, resale_deadline, resale_count, tx_hash FROM tickets WHERE owner = ?1 ORDER BY ticket_id;";
const RESALE_LISTINGS: &str = "SELECT ticket_id, event_id, type_id, owner, is_used, used_at, minted_at, is_for_resale, resale_price, resale_deadline, resale_count, tx_hash FROM tickets WHERE is_for_resale = 1 AND (?1 IS NULL OR event_id = ?1) ORDER BY ticket_id;";
const PURCHASE_TICKETS: &str = "SELECT ticket_id, event_id, type_id, owner, is_used, used_at, minted_at, is_for_resale, resale_price, resale_deadline, resale_count, tx_hash FROM tickets WHERE tx_hash = ?1 ORDER BY ticket_id;";
const GET_USER: &str = "SELECT address, role, created_block FROM users WHERE address = ?1;";
const USER_TRANSACTIONS: &str = "SELECT tx_hash, log_index, kind, sender, recipient, amount, event_id, ticket_id, block_number, timestamp FROM transactions WHERE sender = ?1 OR recipient = ?1 ORDER BY block_number DESC, log_index DESC;";
const TRANSACTIONS_BY_KIND: &str = "SELECT tx_hash, log_index, kind, sender, recipient, amount, event_id, ticket_id, block_number, timestamp FROM transactions WHERE kind = ?1 ORDER BY block_number, log_index;";
const REVENUE_SHARES: &str = "SELECT beneficiary, percentage FROM revenue_shares WHERE event_id = ?1 ORDER BY beneficiary;";

fn create_event(
    con: &Connection,
    event: &NewEvent,
    shares: &[RevenueShare],
    origin: &Origin,
) -> Result<Outcome> {
    upsert_user(con, &event.creator, Role::Organizer, origin)?;

    let event_id = int(event.event_id, "event id")?;
    let inserted = con
        .prepare_cached(INSERT_EVENT)?
        .execute(params![
            event_id,
            &event.creator,
            &event.name,
            &event.event_uri,
            &event.document_uri,
            int(event.event_date, "event date")?,
            event.event_active,
            int(event.created_at, "created at")?,
            &origin.tx_hash,
            int(origin.block_number, "block")?,
        ])
        .context("execute INSERT_EVENT")?
        == 1;

    let mut insert_share = con.prepare_cached(INSERT_REVENUE_SHARE)?;
    for share in shares {
        insert_share
            .execute(params![
                event_id,
                &share.beneficiary,
                int(share.percentage, "percentage")?,
            ])
            .context("execute INSERT_REVENUE_SHARE")?;
    }

    insert_transaction(
        con,
        &AuditEntry {
            kind: TransactionKind::EventCreation,
            from: Some(&event.creator),
            to: None,
            amount: "0",
            event_id: Some(event.event_id),
            ticket_id: None,
        },
        origin,
    )?;

    Ok(if inserted {
        Outcome::Applied
    } else {
        Outcome::Duplicate
    })
}

fn set_event_status(
    con: &Connection,
    event_id: u64,
    status: EventStatus,
    creator: &str,
    origin: &Origin,
) -> Result<Outcome> {
    let id = int(event_id, "event id")?;
    let approved_at = match status {
        EventStatus::Approved => Some(int(origin.timestamp, "timestamp")?),
        _ => None,
    };
    let changed = con
        .prepare_cached(SET_EVENT_STATUS)?
        .execute(params![id, status.as_str(), approved_at])
        .context("execute SET_EVENT_STATUS")?;
    if changed == 0 {
        let current: Option<String> = query_row(con, GET_EVENT_STATUS, params![id], |row| {
            Ok(row.get(0)?)
        })?;
        return Ok(match current {
            None => Outcome::Missing("event"),
            Some(current) if current == status.as_str() => Outcome::Duplicate,
            Some(_) => Outcome::Ignored("event is no longer pending"),
        });
    }

    let kind = match status {
        EventStatus::Rejected => TransactionKind::EventRejection,
        _ => TransactionKind::EventApproval,
    };
    insert_transaction(
        con,
        &AuditEntry {
            kind,
            from: Some(creator),
            to: None,
            amount: "0",
            event_id: Some(event_id),
            ticket_id: None,
        },
        origin,
    )?;
    Ok(Outcome::Applied)
}

fn add_ticket_type(con: &Connection, ticket_type: &NewTicketType, origin: &Origin) -> Result<Outcome> {
    let event_id = int(ticket_type.event_id, "event id")?;
    let type_id = int(ticket_type.type_id, "type id")?;

    // Purchases of this type that were applied before the type itself.
    let credited: i64 = con
        .prepare_cached(CREDITED_SOLD)?
        .query_row(params![event_id, type_id], |row| row.get(0))
        .context("query CREDITED_SOLD")?;
    let inserted = con
        .prepare_cached(INSERT_TICKET_TYPE)?
        .execute(params![
            event_id,
            type_id,
            &ticket_type.name,
            &ticket_type.price,
            int(ticket_type.total_supply, "total supply")?,
            credited,
            int(ticket_type.sale_start, "sale start")?,
            int(ticket_type.sale_end, "sale end")?,
            ticket_type.active,
            int(origin.block_number, "block")?,
            int(origin.log_index, "log index")?,
        ])
        .context("execute INSERT_TICKET_TYPE")?
        == 1;
    con.prepare_cached(ACTIVATE_EVENT)?
        .execute(params![event_id])
        .context("execute ACTIVATE_EVENT")?;

    let creator = event_creator(con, event_id)?;
    insert_transaction(
        con,
        &AuditEntry {
            kind: TransactionKind::TicketTypeAdded,
            from: creator.as_deref(),
            to: None,
            amount: "0",
            event_id: Some(ticket_type.event_id),
            ticket_id: None,
        },
        origin,
    )?;

    Ok(if inserted {
        Outcome::Applied
    } else {
        Outcome::Duplicate
    })
}

fn update_ticket_type(
    con: &Connection,
    update: &TicketTypeUpdate,
    origin: &Origin,
) -> Result<Outcome> {
    let event_id = int(update.event_id, "event id")?;
    let type_id = int(update.type_id, "type id")?;
    let changed = con
        .prepare_cached(UPDATE_TICKET_TYPE)?
        .execute(params![
            event_id,
            type_id,
            &update.price,
            int(update.total_supply, "total supply")?,
            int(update.sale_start, "sale start")?,
            int(update.sale_end, "sale end")?,
            update.active,
            int(origin.block_number, "block")?,
            int(origin.log_index, "log index")?,
        ])
        .context("execute UPDATE_TICKET_TYPE")?;
    if changed == 0 {
        let exists: bool = con
            .prepare_cached(TICKET_TYPE_EXISTS)?
            .query_row(params![event_id, type_id], |row| row.get(0))
            .context("query TICKET_TYPE_EXISTS")?;
        return Ok(if exists {
            Outcome::Duplicate
        } else {
            Outcome::Missing("ticket type")
        });
    }

    let creator = event_creator(con, event_id)?;
    insert_transaction(
        con,
        &AuditEntry {
            kind: TransactionKind::TicketTypeUpdated,
            from: creator.as_deref(),
            to: None,
            amount: "0",
            event_id: Some(update.event_id),
            ticket_id: None,
        },
        origin,
    )?;
    Ok(Outcome::Applied)
}

fn mint_ticket(con: &Connection, mint: &Mint, origin: &Origin) -> Result<Outcome> {
    let inserted = con
        .prepare_cached(INSERT_TICKET)?
        .execute(params![
            int(mint.ticket_id, "ticket id")?,
            int(mint.event_id, "event id")?,
            int(mint.type_id, "type id")?,
            &mint.owner,
            int(origin.timestamp, "timestamp")?,
            &origin.tx_hash,
            int(origin.block_number, "block")?,
            int(origin.log_index, "log index")?,
        ])
        .context("execute INSERT_TICKET")?
        == 1;
    if !inserted {
        return Ok(Outcome::Duplicate);
    }

    upsert_user(con, &mint.owner, Role::Buyer, origin)?;
    credit(con, &origin.tx_hash, mint.event_id, mint.type_id, 1, 0)?;
    Ok(Outcome::Applied)
}

fn record_purchase(con: &Connection, purchase: &Purchase, origin: &Origin) -> Result<Outcome> {
    let inserted = insert_transaction(
        con,
        &AuditEntry {
            kind: TransactionKind::TicketPurchase,
            from: Some(&purchase.buyer),
            to: None,
            amount: &purchase.total_cost,
            event_id: Some(purchase.event_id),
            ticket_id: None,
        },
        origin,
    )?;
    if !inserted {
        return Ok(Outcome::Duplicate);
    }

    upsert_user(con, &purchase.buyer, Role::Buyer, origin)?;
    credit(
        con,
        &origin.tx_hash,
        purchase.event_id,
        purchase.type_id,
        0,
        purchase.quantity,
    )?;
    Ok(Outcome::Applied)
}

/// Adds mint and purchase counts for a transaction and raises the type's sold
/// counter by whatever is not yet credited.
fn credit(
    con: &Connection,
    tx_hash: &str,
    event_id: u64,
    type_id: u64,
    minted: u64,
    purchased: u64,
) -> Result<()> {
    let event_id = int(event_id, "event id")?;
    let type_id = int(type_id, "type id")?;
    con.prepare_cached(NEW_CREDIT)?
        .execute(params![tx_hash, event_id, type_id])
        .context("execute NEW_CREDIT")?;
    let (minted, purchased, credited) = con
        .prepare_cached(ADD_CREDIT)?
        .query_row(
            params![
                tx_hash,
                event_id,
                type_id,
                int(minted, "minted")?,
                int(purchased, "purchased")?,
            ],
            |row| Ok((row.get::<_, i64>(0)?, row.get::<_, i64>(1)?, row.get::<_, i64>(2)?)),
        )
        .context("query ADD_CREDIT")?;

    let (minted, purchased, credited) = (
        uint(minted, "minted")?,
        uint(purchased, "purchased")?,
        uint(credited, "credited")?,
    );
    let delta = credit_delta(minted, purchased, credited);
    if delta == 0 {
        return Ok(());
    }

    con.prepare_cached(SET_CREDITED)?
        .execute(params![
            tx_hash,
            event_id,
            type_id,
            int(credited + delta, "credited")?
        ])
        .context("execute SET_CREDITED")?;
    con.prepare_cached(ADD_SOLD)?
        .execute(params![event_id, type_id, int(delta, "sold")?])
        .context("execute ADD_SOLD")?;
    Ok(())
}

fn list_ticket(con: &Connection, listing: &Listing, origin: &Origin) -> Result<Outcome> {
    let ticket_id = int(listing.ticket_id, "ticket id")?;
    let state = match ticket_state(con, ticket_id)? {
        None => return Ok(Outcome::Missing("ticket")),
        Some(state) if state.used_before(origin) => {
            return Ok(Outcome::Ignored("ticket already used"))
        }
        Some(state) => state,
    };

    let changed = con
        .prepare_cached(LIST_TICKET)?
        .execute(params![
            ticket_id,
            &listing.price,
            int(listing.deadline, "deadline")?,
            int(origin.block_number, "block")?,
            int(origin.log_index, "log index")?,
        ])
        .context("execute LIST_TICKET")?;

    insert_transaction(
        con,
        &AuditEntry {
            kind: TransactionKind::TicketResaleListing,
            from: Some(&state.owner),
            to: None,
            amount: &listing.price,
            event_id: None,
            ticket_id: Some(listing.ticket_id),
        },
        origin,
    )?;
    Ok(if changed == 0 {
        Outcome::Duplicate
    } else {
        Outcome::Applied
    })
}

fn resell_ticket(con: &Connection, resale: &Resale, origin: &Origin) -> Result<Outcome> {
    let ticket_id = int(resale.ticket_id, "ticket id")?;
    // A resale that happened before the ticket was used still moves
    // ownership, even when the use was applied first.
    match ticket_state(con, ticket_id)? {
        None => return Ok(Outcome::Missing("ticket")),
        Some(state) if state.used_before(origin) => {
            return Ok(Outcome::Ignored("ticket already used"))
        }
        Some(_) => {}
    }

    // The audit row doubles as the marker that this resale was counted.
    let inserted = insert_transaction(
        con,
        &AuditEntry {
            kind: TransactionKind::TicketResale,
            from: Some(&resale.from),
            to: Some(&resale.to),
            amount: &resale.price,
            event_id: None,
            ticket_id: Some(resale.ticket_id),
        },
        origin,
    )?;
    if !inserted {
        return Ok(Outcome::Duplicate);
    }

    let block = int(origin.block_number, "block")?;
    let log_index = int(origin.log_index, "log index")?;
    upsert_user(con, &resale.to, Role::Buyer, origin)?;
    con.prepare_cached(TRANSFER_TICKET)?
        .execute(params![ticket_id, &resale.to, block, log_index])
        .context("execute TRANSFER_TICKET")?;
    con.prepare_cached(CLEAR_LISTING)?
        .execute(params![ticket_id, block, log_index])
        .context("execute CLEAR_LISTING")?;
    con.prepare_cached(COUNT_RESALE)?
        .execute(params![ticket_id])
        .context("execute COUNT_RESALE")?;
    Ok(Outcome::Applied)
}

fn cancel_listing(con: &Connection, ticket_id: u64, origin: &Origin) -> Result<Outcome> {
    let id = int(ticket_id, "ticket id")?;
    let state = match ticket_state(con, id)? {
        None => return Ok(Outcome::Missing("ticket")),
        Some(state) if state.used_before(origin) => {
            return Ok(Outcome::Ignored("ticket already used"))
        }
        Some(state) => state,
    };

    let changed = con
        .prepare_cached(CLEAR_LISTING)?
        .execute(params![
            id,
            int(origin.block_number, "block")?,
            int(origin.log_index, "log index")?,
        ])
        .context("execute CLEAR_LISTING")?;

    insert_transaction(
        con,
        &AuditEntry {
            kind: TransactionKind::TicketResaleCancelled,
            from: Some(&state.owner),
            to: None,
            amount: "0",
            event_id: None,
            ticket_id: Some(ticket_id),
        },
        origin,
    )?;
    Ok(if changed == 0 {
        Outcome::Duplicate
    } else {
        Outcome::Applied
    })
}

fn use_ticket(con: &Connection, usage: &Usage, origin: &Origin) -> Result<Outcome> {
    let id = int(usage.ticket_id, "ticket id")?;
    let changed = con
        .prepare_cached(USE_TICKET)?
        .execute(params![
            id,
            int(origin.timestamp, "timestamp")?,
            int(origin.block_number, "block")?,
            int(origin.log_index, "log index")?,
        ])
        .context("execute USE_TICKET")?;
    if changed == 0 {
        return Ok(match ticket_state(con, id)? {
            None => Outcome::Missing("ticket"),
            Some(_) => Outcome::Duplicate,
        });
    }

    upsert_user(con, &usage.user, Role::Buyer, origin)?;
    insert_transaction(
        con,
        &AuditEntry {
            kind: TransactionKind::TicketUse,
            from: Some(&usage.user),
            to: None,
            amount: "0",
            event_id: Some(usage.event_id),
            ticket_id: Some(usage.ticket_id),
        },
        origin,
    )?;
    Ok(Outcome::Applied)
}

fn upsert_user(con: &Connection, address: &str, role: Role, origin: &Origin) -> Result<()> {
    con.prepare_cached(UPSERT_USER)?
        .execute(params![
            address,
            role.as_str(),
            int(origin.block_number, "block")?
        ])
        .context("execute UPSERT_USER")?;
    Ok(())
}

/// Appends an audit trail entry. Returns `false` if the entry for this log
/// already exists.
fn insert_transaction(con: &Connection, entry: &AuditEntry, origin: &Origin) -> Result<bool> {
    let rows = con
        .prepare_cached(INSERT_TRANSACTION)?
        .execute(params![
            &origin.tx_hash,
            int(origin.log_index, "log index")?,
            entry.kind.as_str(),
            entry.from,
            entry.to,
            entry.amount,
            entry.event_id.map(|id| int(id, "event id")).transpose()?,
            entry.ticket_id.map(|id| int(id, "ticket id")).transpose()?,
            int(origin.block_number, "block")?,
            int(origin.timestamp, "timestamp")?,
        ])
        .context("execute INSERT_TRANSACTION")?;
    Ok(rows == 1)
}

fn event_creator(con: &Connection, event_id: i64) -> Result<Option<String>> {
    query_row(con, GET_EVENT_CREATOR, params![event_id], |row| Ok(row.get(0)?))
}

fn ticket_state(con: &Connection, ticket_id: i64) -> Result<Option<TicketState>> {
    query_row(con, GET_TICKET_STATE, params![ticket_id], |row| {
        let block: Option<i64> = row.get(1)?;
        let log_index: Option<i64> = row.get(2)?;
        Ok(TicketState {
            owner: row.get(0)?,
            used: match (block, log_index) {
                (Some(block), Some(log_index)) => {
                    Some((uint(block, "block")?, uint(log_index, "log index")?))
                }
                _ => None,
            },
        })
    })
}

fn query_rows<T>(
    con: &Connection,
    sql: &str,
    params: impl Params,
    map: impl Fn(&Row) -> Result<T>,
) -> Result<Vec<T>> {
    let mut statement = con.prepare_cached(sql)?;
    let mut rows = statement.query(params)?;
    let mut result = Vec::new();
    while let Some(row) = rows.next()? {
        result.push(map(row)?);
    }
    Ok(result)
}

fn query_row<T>(
    con: &Connection,
    sql: &str,
    params: impl Params,
    map: impl Fn(&Row) -> Result<T>,
) -> Result<Option<T>> {
    let mut statement = con.prepare_cached(sql)?;
    let mut rows = statement.query(params)?;
    rows.next()?.map(map).transpose()
}

fn optional_uint(value: Option<i64>, what: &str) -> Result<Option<u64>> {
    value.map(|value| uint(value, what)).transpose()
}

fn event_row(row: &Row) -> Result<Event> {
    Ok(Event {
        event_id: uint(row.get(0)?, "event id")?,
        creator: row.get(1)?,
        name: row.get(2)?,
        event_uri: row.get(3)?,
        document_uri: row.get(4)?,
        event_date: uint(row.get(5)?, "event date")?,
        event_active: row.get(6)?,
        status: row.get::<_, String>(7)?.parse()?,
        created_at: uint(row.get(8)?, "created at")?,
        approved_at: optional_uint(row.get(9)?, "approved at")?,
        tx_hash: row.get(10)?,
        block_number: uint(row.get(11)?, "block")?,
    })
}

fn ticket_type_row(row: &Row) -> Result<TicketType> {
    Ok(TicketType {
        event_id: uint(row.get(0)?, "event id")?,
        type_id: uint(row.get(1)?, "type id")?,
        name: row.get(2)?,
        price: row.get(3)?,
        total_supply: uint(row.get(4)?, "total supply")?,
        sold: uint(row.get(5)?, "sold")?,
        sale_start: uint(row.get(6)?, "sale start")?,
        sale_end: uint(row.get(7)?, "sale end")?,
        active: row.get(8)?,
    })
}

fn ticket_row(row: &Row) -> Result<Ticket> {
    Ok(Ticket {
        ticket_id: uint(row.get(0)?, "ticket id")?,
        event_id: uint(row.get(1)?, "event id")?,
        type_id: uint(row.get(2)?, "type id")?,
        owner: row.get(3)?,
        is_used: row.get(4)?,
        used_at: optional_uint(row.get(5)?, "used at")?,
        minted_at: uint(row.get(6)?, "minted at")?,
        is_for_resale: row.get(7)?,
        resale_price: row.get(8)?,
        resale_deadline: optional_uint(row.get(9)?, "resale deadline")?,
        resale_count: uint(row.get(10)?, "resale count")?,
        tx_hash: row.get(11)?,
    })
}

fn user_row(row: &Row) -> Result<User> {
    Ok(User {
        address: row.get(0)?,
        role: row.get::<_, String>(1)?.parse()?,
        created_block: uint(row.get(2)?, "created block")?,
    })
}

fn transaction_row(row: &Row) -> Result<Transaction> {
    Ok(Transaction {
        tx_hash: row.get(0)?,
        log_index: uint(row.get(1)?, "log index")?,
        kind: row.get::<_, String>(2)?.parse()?,
        from: row.get(3)?,
        to: row.get(4)?,
        amount: row.get(5)?,
        event_id: optional_uint(row.get(6)?, "event id")?,
        ticket_id: optional_uint(row.get(7)?, "ticket id")?,
        block_number: uint(row.get(8)?, "block")?,
        timestamp: uint(row.get(9)?, "timestamp")?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const ORGANIZER: &str = "0x00000000000000000000000000000000000000aa";
    const ALICE: &str = "0x00000000000000000000000000000000000000b1";
    const BOB: &str = "0x00000000000000000000000000000000000000b2";

    fn origin(block: u64, log_index: u64) -> Origin {
        Origin {
            tx_hash: format!("0x{block:064x}"),
            block_number: block,
            log_index,
            timestamp: 1_700_000_000 + block * 12,
        }
    }

    async fn seed(sqlite: &Sqlite) {
        let event = NewEvent {
            event_id: 7,
            creator: ORGANIZER.to_string(),
            name: "Concert".to_string(),
            created_at: 1_700_000_000,
            ..Default::default()
        };
        sqlite.create_event(&event, &[], &origin(100, 0)).await.unwrap();
        let ticket_type = NewTicketType {
            event_id: 7,
            type_id: 1,
            name: "GA".to_string(),
            price: "1000".to_string(),
            total_supply: 50,
            active: true,
            ..Default::default()
        };
        sqlite.add_ticket_type(&ticket_type, &origin(105, 0)).await.unwrap();
    }

    fn mint(ticket_id: u64, owner: &str) -> Mint {
        Mint {
            ticket_id,
            event_id: 7,
            type_id: 1,
            owner: owner.to_string(),
        }
    }

    #[test]
    fn new_for_test() {
        Sqlite::new_for_test();
    }

    #[tokio::test]
    async fn event_status_only_leaves_pending() {
        let sqlite = Sqlite::new_for_test();
        seed(&sqlite).await;

        let approval = origin(110, 0);
        for expected in [Outcome::Applied, Outcome::Duplicate] {
            let outcome = sqlite
                .set_event_status(7, EventStatus::Approved, ORGANIZER, &approval)
                .await
                .unwrap();
            assert_eq!(outcome, expected);
        }
        assert_eq!(
            sqlite
                .set_event_status(7, EventStatus::Rejected, ORGANIZER, &origin(111, 0))
                .await
                .unwrap(),
            Outcome::Ignored("event is no longer pending")
        );
        assert_eq!(
            sqlite
                .set_event_status(8, EventStatus::Approved, ORGANIZER, &origin(112, 0))
                .await
                .unwrap(),
            Outcome::Missing("event")
        );

        let event = sqlite.event(7).await.unwrap().unwrap();
        assert_eq!(event.status, EventStatus::Approved);
        assert_eq!(event.approved_at, Some(1_700_000_000 + 110 * 12));
        assert!(event.event_active);
        assert_eq!(
            sqlite
                .transactions_by_kind(TransactionKind::EventApproval)
                .await
                .unwrap()
                .len(),
            1
        );
    }

    #[tokio::test]
    async fn duplicate_mint_is_counted_once() {
        let sqlite = Sqlite::new_for_test();
        seed(&sqlite).await;

        let at = origin(120, 3);
        assert_eq!(sqlite.mint_ticket(&mint(1, ALICE), &at).await.unwrap(), Outcome::Applied);
        assert_eq!(sqlite.mint_ticket(&mint(1, ALICE), &at).await.unwrap(), Outcome::Duplicate);

        assert_eq!(sqlite.ticket_type(7, 1).await.unwrap().unwrap().sold, 1);
        assert_eq!(sqlite.user_tickets(ALICE).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn purchase_and_mints_of_one_transaction_share_credit() {
        let sqlite = Sqlite::new_for_test();
        seed(&sqlite).await;

        // One transaction buying three tickets: three mints and a purchase.
        let purchase = Purchase {
            event_id: 7,
            type_id: 1,
            buyer: ALICE.to_string(),
            quantity: 3,
            total_cost: "3000".to_string(),
        };
        let tx = |log_index| Origin {
            tx_hash: "0xfeed".to_string(),
            ..origin(130, log_index)
        };
        sqlite.mint_ticket(&mint(1, ALICE), &tx(0)).await.unwrap();
        sqlite.mint_ticket(&mint(2, ALICE), &tx(1)).await.unwrap();
        assert_eq!(sqlite.ticket_type(7, 1).await.unwrap().unwrap().sold, 2);

        assert_eq!(
            sqlite.record_purchase(&purchase, &tx(3)).await.unwrap(),
            Outcome::Applied
        );
        assert_eq!(sqlite.ticket_type(7, 1).await.unwrap().unwrap().sold, 3);

        sqlite.mint_ticket(&mint(3, ALICE), &tx(2)).await.unwrap();
        assert_eq!(
            sqlite.record_purchase(&purchase, &tx(3)).await.unwrap(),
            Outcome::Duplicate
        );
        assert_eq!(sqlite.ticket_type(7, 1).await.unwrap().unwrap().sold, 3);

        let tickets = sqlite.purchase_tickets("0xFEED").await.unwrap();
        assert_eq!(
            tickets.iter().map(|ticket| ticket.ticket_id).collect::<Vec<_>>(),
            [1, 2, 3]
        );
    }

    #[tokio::test]
    async fn purchases_before_their_type_are_credited_on_creation() {
        let sqlite = Sqlite::new_for_test();
        let purchase = Purchase {
            event_id: 9,
            type_id: 2,
            buyer: BOB.to_string(),
            quantity: 2,
            total_cost: "20".to_string(),
        };
        sqlite.record_purchase(&purchase, &origin(50, 0)).await.unwrap();
        sqlite
            .add_ticket_type(
                &NewTicketType {
                    event_id: 9,
                    type_id: 2,
                    total_supply: 1,
                    ..Default::default()
                },
                &origin(40, 0),
            )
            .await
            .unwrap();

        // Oversold types are mirrored as is.
        let ticket_type = sqlite.ticket_type(9, 2).await.unwrap().unwrap();
        assert_eq!(ticket_type.sold, 2);
        assert_eq!(ticket_type.total_supply, 1);
    }

    #[tokio::test]
    async fn used_tickets_cannot_be_listed() {
        let sqlite = Sqlite::new_for_test();
        seed(&sqlite).await;
        sqlite.mint_ticket(&mint(1, ALICE), &origin(120, 0)).await.unwrap();

        let usage = Usage {
            ticket_id: 1,
            event_id: 7,
            user: ALICE.to_string(),
        };
        assert_eq!(sqlite.use_ticket(&usage, &origin(140, 0)).await.unwrap(), Outcome::Applied);
        assert_eq!(sqlite.use_ticket(&usage, &origin(140, 0)).await.unwrap(), Outcome::Duplicate);

        let listing = Listing {
            ticket_id: 1,
            price: "5".to_string(),
            deadline: 1_800_000_000,
        };
        assert_eq!(
            sqlite.list_ticket(&listing, &origin(150, 0)).await.unwrap(),
            Outcome::Ignored("ticket already used")
        );
        // A listing from before the use is recorded but does not reopen the
        // ticket for resale.
        assert_eq!(
            sqlite.list_ticket(&listing, &origin(130, 0)).await.unwrap(),
            Outcome::Duplicate
        );

        let ticket = sqlite.ticket(1).await.unwrap().unwrap();
        assert!(ticket.is_used);
        assert!(!ticket.is_for_resale);
        assert_eq!(ticket.used_at, Some(1_700_000_000 + 140 * 12));
    }

    #[tokio::test]
    async fn resale_before_use_applies_when_it_arrives_late() {
        let sqlite = Sqlite::new_for_test();
        seed(&sqlite).await;
        sqlite.mint_ticket(&mint(1, ALICE), &origin(110, 0)).await.unwrap();
        let listing = Listing {
            ticket_id: 1,
            price: "10".to_string(),
            deadline: 1_800_000_000,
        };
        sqlite.list_ticket(&listing, &origin(111, 0)).await.unwrap();

        // `TicketUsed` is scanned before `TicketResold`.
        let usage = Usage {
            ticket_id: 1,
            event_id: 7,
            user: BOB.to_string(),
        };
        assert_eq!(sqlite.use_ticket(&usage, &origin(113, 0)).await.unwrap(), Outcome::Applied);
        let resale = Resale {
            ticket_id: 1,
            from: ALICE.to_string(),
            to: BOB.to_string(),
            price: "10".to_string(),
        };
        assert_eq!(sqlite.resell_ticket(&resale, &origin(112, 0)).await.unwrap(), Outcome::Applied);
        assert_eq!(sqlite.resell_ticket(&resale, &origin(112, 0)).await.unwrap(), Outcome::Duplicate);
        assert_eq!(
            sqlite.resell_ticket(&resale, &origin(114, 0)).await.unwrap(),
            Outcome::Ignored("ticket already used")
        );

        let ticket = sqlite.ticket(1).await.unwrap().unwrap();
        assert_eq!(ticket.owner, BOB);
        assert_eq!(ticket.resale_count, 1);
        assert!(ticket.is_used);
        assert!(!ticket.is_for_resale);
        assert_eq!(ticket.resale_price, None);
        assert_eq!(
            sqlite
                .transactions_by_kind(TransactionKind::TicketResale)
                .await
                .unwrap()
                .len(),
            1
        );
    }

    #[tokio::test]
    async fn resale_applied_after_a_newer_listing() {
        let sqlite = Sqlite::new_for_test();
        seed(&sqlite).await;
        sqlite.mint_ticket(&mint(1, ALICE), &origin(120, 0)).await.unwrap();

        // Scanned by signature: both listings come in before the resale that
        // happened between them.
        let listing = |price: &str| Listing {
            ticket_id: 1,
            price: price.to_string(),
            deadline: 1_800_000_000,
        };
        sqlite.list_ticket(&listing("10"), &origin(130, 0)).await.unwrap();
        sqlite.list_ticket(&listing("20"), &origin(150, 0)).await.unwrap();
        let resale = Resale {
            ticket_id: 1,
            from: ALICE.to_string(),
            to: BOB.to_string(),
            price: "10".to_string(),
        };
        assert_eq!(sqlite.resell_ticket(&resale, &origin(140, 0)).await.unwrap(), Outcome::Applied);
        assert_eq!(sqlite.resell_ticket(&resale, &origin(140, 0)).await.unwrap(), Outcome::Duplicate);

        let ticket = sqlite.ticket(1).await.unwrap().unwrap();
        assert_eq!(ticket.owner, BOB);
        assert_eq!(ticket.resale_count, 1);
        assert!(ticket.is_for_resale);
        assert_eq!(ticket.resale_price.as_deref(), Some("20"));
        assert!(!ticket.can_resell());

        assert_eq!(sqlite.resale_listings(Some(7)).await.unwrap().len(), 1);
        assert!(sqlite.resale_listings(Some(8)).await.unwrap().is_empty());

        let history = sqlite.user_transactions(BOB).await.unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].kind, TransactionKind::TicketResale);
        assert_eq!(sqlite.user(BOB).await.unwrap().unwrap().role, Role::Buyer);
    }

    #[tokio::test]
    async fn cancelling_clears_listing() {
        let sqlite = Sqlite::new_for_test();
        seed(&sqlite).await;
        sqlite.mint_ticket(&mint(1, ALICE), &origin(120, 0)).await.unwrap();
        sqlite
            .list_ticket(
                &Listing {
                    ticket_id: 1,
                    price: "10".to_string(),
                    deadline: 1,
                },
                &origin(130, 0),
            )
            .await
            .unwrap();

        assert_eq!(sqlite.cancel_listing(1, &origin(131, 0)).await.unwrap(), Outcome::Applied);
        assert_eq!(sqlite.cancel_listing(1, &origin(131, 0)).await.unwrap(), Outcome::Duplicate);
        assert_eq!(
            sqlite.cancel_listing(2, &origin(132, 0)).await.unwrap(),
            Outcome::Missing("ticket")
        );

        let ticket = sqlite.ticket(1).await.unwrap().unwrap();
        assert!(!ticket.is_for_resale);
        assert_eq!(ticket.resale_price, None);
    }

    #[tokio::test]
    async fn checkpoint_never_moves_backwards() {
        let sqlite = Sqlite::new_for_test();
        assert_eq!(sqlite.checkpoint().await.unwrap(), None);
        assert_eq!(sqlite.advance_checkpoint(100).await.unwrap(), 100);
        assert_eq!(sqlite.advance_checkpoint(50).await.unwrap(), 100);
        assert_eq!(sqlite.checkpoint().await.unwrap(), Some(100));

        assert_eq!(sqlite.scan_cursor("TicketMinted").await.unwrap(), None);
        sqlite.set_scan_cursor("TicketMinted", 999).await.unwrap();
        sqlite.set_scan_cursor("TicketMinted", 10).await.unwrap();
        assert_eq!(sqlite.scan_cursor("TicketMinted").await.unwrap(), Some(999));
    }

    #[tokio::test]
    async fn latest_transaction_block() {
        let sqlite = Sqlite::new_for_test();
        assert_eq!(sqlite.latest_transaction_block().await.unwrap(), None);
        seed(&sqlite).await;
        assert_eq!(sqlite.latest_transaction_block().await.unwrap(), Some(105));
    }

    #[tokio::test]
    async fn revenue_shares_are_stored_once() {
        let sqlite = Sqlite::new_for_test();
        let event = NewEvent {
            event_id: 1,
            creator: ORGANIZER.to_string(),
            ..Default::default()
        };
        let shares = [
            RevenueShare {
                beneficiary: ALICE.to_string(),
                percentage: 70,
            },
            RevenueShare {
                beneficiary: BOB.to_string(),
                percentage: 30,
            },
        ];
        let at = origin(1, 0);
        assert_eq!(sqlite.create_event(&event, &shares, &at).await.unwrap(), Outcome::Applied);
        assert_eq!(sqlite.create_event(&event, &shares, &at).await.unwrap(), Outcome::Duplicate);

        assert_eq!(sqlite.revenue_shares(1).await.unwrap(), shares);
        assert_eq!(sqlite.events_by_creator(ORGANIZER).await.unwrap().len(), 1);
        assert_eq!(
            sqlite.user(ORGANIZER).await.unwrap().unwrap().role,
            Role::Organizer
        );
    }
}
