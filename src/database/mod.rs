//! Relational mirror of the ticketing contract.
//!
//! Every mutation runs in a single SQL transaction and either applies in full
//! or not at all. Mutations are idempotent: re-applying a log that was already
//! stored reports [`Outcome::Duplicate`] and changes nothing.

mod postgres;
mod sqlite;

pub use self::{postgres::Postgres, sqlite::Sqlite};
use anyhow::{Context, Result};
use futures::future::BoxFuture;
use solabi::ethprim::{Address, Digest, U256};
use std::{fmt, str::FromStr, sync::Arc};
use url::Url;

/// Opens the database backend selected by the URL scheme (`sqlite://` or
/// `postgresql://`).
pub async fn open(url: &Url) -> Result<Arc<dyn Database>> {
    match url.scheme() {
        "sqlite" => Ok(Arc::new(Sqlite::open(url)?)),
        "postgres" | "postgresql" => Ok(Arc::new(Postgres::connect(url.as_str()).await?)),
        scheme => anyhow::bail!("unsupported database scheme {scheme:?}"),
    }
}

/// Formats an address the way it is stored: `0x` followed by lower-case hex.
pub fn address(address: &Address) -> String {
    format!("0x{}", hex::encode(address.0))
}

/// Formats a transaction hash the way it is stored.
pub fn hash(digest: &Digest) -> String {
    crate::chain::digest_hex(digest)
}

/// Formats a token amount as a base-10 string. Amounts are stored as text so
/// that no precision is lost.
pub fn amount(value: &U256) -> String {
    value.to_string()
}

/// Where a mutation came from on chain.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct Origin {
    pub tx_hash: String,
    pub block_number: u64,
    pub log_index: u64,
    /// Block timestamp in Unix seconds.
    pub timestamp: u64,
}

/// The result of applying a single mutation.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Outcome {
    /// The mutation changed the datastore.
    Applied,
    /// The log was already applied; nothing changed.
    Duplicate,
    /// A row the mutation depends on does not exist.
    Missing(&'static str),
    /// The mutation is not allowed in the current state of the row.
    Ignored(&'static str),
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum EventStatus {
    Pending,
    Approved,
    Rejected,
}

impl EventStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            EventStatus::Pending => "PENDING",
            EventStatus::Approved => "APPROVED",
            EventStatus::Rejected => "REJECTED",
        }
    }
}

impl FromStr for EventStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "PENDING" => Ok(EventStatus::Pending),
            "APPROVED" => Ok(EventStatus::Approved),
            "REJECTED" => Ok(EventStatus::Rejected),
            _ => anyhow::bail!("unknown event status {s:?}"),
        }
    }
}

impl fmt::Display for EventStatus {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum Role {
    /// Event organizer.
    Organizer,
    Buyer,
}

impl Role {
    pub fn as_str(self) -> &'static str {
        match self {
            Role::Organizer => "EO",
            Role::Buyer => "BUYER",
        }
    }
}

impl FromStr for Role {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "EO" => Ok(Role::Organizer),
            "BUYER" => Ok(Role::Buyer),
            _ => anyhow::bail!("unknown user role {s:?}"),
        }
    }
}

/// Tag of an audit trail entry.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum TransactionKind {
    EventCreation,
    EventApproval,
    EventRejection,
    TicketTypeAdded,
    TicketTypeUpdated,
    TicketPurchase,
    TicketResaleListing,
    TicketResale,
    TicketResaleCancelled,
    TicketUse,
}

impl TransactionKind {
    pub fn as_str(self) -> &'static str {
        match self {
            TransactionKind::EventCreation => "EVENT_CREATION",
            TransactionKind::EventApproval => "EVENT_APPROVAL",
            TransactionKind::EventRejection => "EVENT_REJECTION",
            TransactionKind::TicketTypeAdded => "TICKET_TYPE_ADDED",
            TransactionKind::TicketTypeUpdated => "TICKET_TYPE_UPDATED",
            TransactionKind::TicketPurchase => "TICKET_PURCHASE",
            TransactionKind::TicketResaleListing => "TICKET_RESALE_LISTING",
            TransactionKind::TicketResale => "TICKET_RESALE",
            TransactionKind::TicketResaleCancelled => "TICKET_RESALE_CANCELLED",
            TransactionKind::TicketUse => "TICKET_USE",
        }
    }
}

impl FromStr for TransactionKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        Ok(match s {
            "EVENT_CREATION" => TransactionKind::EventCreation,
            "EVENT_APPROVAL" => TransactionKind::EventApproval,
            "EVENT_REJECTION" => TransactionKind::EventRejection,
            "TICKET_TYPE_ADDED" => TransactionKind::TicketTypeAdded,
            "TICKET_TYPE_UPDATED" => TransactionKind::TicketTypeUpdated,
            "TICKET_PURCHASE" => TransactionKind::TicketPurchase,
            "TICKET_RESALE_LISTING" => TransactionKind::TicketResaleListing,
            "TICKET_RESALE" => TransactionKind::TicketResale,
            "TICKET_RESALE_CANCELLED" => TransactionKind::TicketResaleCancelled,
            "TICKET_USE" => TransactionKind::TicketUse,
            _ => anyhow::bail!("unknown transaction kind {s:?}"),
        })
    }
}

// Mutation inputs. Addresses are already formatted with [`address`] and
// amounts with [`amount`].

#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct NewEvent {
    pub event_id: u64,
    pub creator: String,
    pub name: String,
    pub event_uri: String,
    pub document_uri: String,
    pub event_date: u64,
    pub event_active: bool,
    pub created_at: u64,
}

#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct RevenueShare {
    pub beneficiary: String,
    /// Share in basis points or percent, exactly as the contract reports it.
    pub percentage: u64,
}

#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct NewTicketType {
    pub event_id: u64,
    pub type_id: u64,
    pub name: String,
    pub price: String,
    pub total_supply: u64,
    pub sale_start: u64,
    pub sale_end: u64,
    pub active: bool,
}

#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct TicketTypeUpdate {
    pub event_id: u64,
    pub type_id: u64,
    pub price: String,
    pub total_supply: u64,
    pub sale_start: u64,
    pub sale_end: u64,
    pub active: bool,
}

#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct Mint {
    pub ticket_id: u64,
    pub event_id: u64,
    pub type_id: u64,
    pub owner: String,
}

#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct Purchase {
    pub event_id: u64,
    pub type_id: u64,
    pub buyer: String,
    pub quantity: u64,
    pub total_cost: String,
}

#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct Listing {
    pub ticket_id: u64,
    pub price: String,
    pub deadline: u64,
}

#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct Resale {
    pub ticket_id: u64,
    pub from: String,
    pub to: String,
    pub price: String,
}

#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct Usage {
    pub ticket_id: u64,
    pub event_id: u64,
    pub user: String,
}

// Stored rows.

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Event {
    pub event_id: u64,
    pub creator: String,
    pub name: String,
    pub event_uri: String,
    pub document_uri: String,
    pub event_date: u64,
    pub event_active: bool,
    pub status: EventStatus,
    pub created_at: u64,
    pub approved_at: Option<u64>,
    pub tx_hash: String,
    pub block_number: u64,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct TicketType {
    pub event_id: u64,
    pub type_id: u64,
    pub name: String,
    pub price: String,
    pub total_supply: u64,
    pub sold: u64,
    pub sale_start: u64,
    pub sale_end: u64,
    pub active: bool,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Ticket {
    pub ticket_id: u64,
    pub event_id: u64,
    pub type_id: u64,
    pub owner: String,
    pub is_used: bool,
    pub used_at: Option<u64>,
    pub minted_at: u64,
    pub is_for_resale: bool,
    pub resale_price: Option<String>,
    pub resale_deadline: Option<u64>,
    pub resale_count: u64,
    /// Hash of the transaction that minted the ticket.
    pub tx_hash: String,
}

impl Ticket {
    /// Whether the ticket may still be put up for resale. A ticket can be
    /// resold at most once and never after it was used.
    pub fn can_resell(&self) -> bool {
        !self.is_used && self.resale_count < 1
    }
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Transaction {
    pub tx_hash: String,
    pub log_index: u64,
    pub kind: TransactionKind,
    pub from: Option<String>,
    pub to: Option<String>,
    pub amount: String,
    pub event_id: Option<u64>,
    pub ticket_id: Option<u64>,
    pub block_number: u64,
    pub timestamp: u64,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct User {
    pub address: String,
    pub role: Role,
    pub created_block: u64,
}

/// Abstraction over specific SQL like backends.
///
/// All mutating methods either succeed in full or error without having
/// applied any changes. This is accomplished by using SQL transactions.
pub trait Database: Send + Sync {
    /// Stores a newly created event together with its revenue shares and
    /// upserts the creator as an organizer. Events always start out pending.
    fn create_event<'a>(
        &'a self,
        event: &'a NewEvent,
        shares: &'a [RevenueShare],
        origin: &'a Origin,
    ) -> BoxFuture<'a, Result<Outcome>>;

    /// Moves a pending event to `status`. Events that are no longer pending
    /// are left alone.
    fn set_event_status<'a>(
        &'a self,
        event_id: u64,
        status: EventStatus,
        creator: &'a str,
        origin: &'a Origin,
    ) -> BoxFuture<'a, Result<Outcome>>;

    /// Adds a ticket type and marks its event active.
    fn add_ticket_type<'a>(
        &'a self,
        ticket_type: &'a NewTicketType,
        origin: &'a Origin,
    ) -> BoxFuture<'a, Result<Outcome>>;

    fn update_ticket_type<'a>(
        &'a self,
        update: &'a TicketTypeUpdate,
        origin: &'a Origin,
    ) -> BoxFuture<'a, Result<Outcome>>;

    /// Stores a minted ticket and credits it to the type's sold counter.
    fn mint_ticket<'a>(&'a self, mint: &'a Mint, origin: &'a Origin)
        -> BoxFuture<'a, Result<Outcome>>;

    /// Records a purchase and credits its quantity to the type's sold
    /// counter.
    ///
    /// A purchase and the mints of the same transaction describe the same
    /// tickets; the sold counter is raised by the larger of the two counts,
    /// never by both.
    fn record_purchase<'a>(
        &'a self,
        purchase: &'a Purchase,
        origin: &'a Origin,
    ) -> BoxFuture<'a, Result<Outcome>>;

    fn list_ticket<'a>(
        &'a self,
        listing: &'a Listing,
        origin: &'a Origin,
    ) -> BoxFuture<'a, Result<Outcome>>;

    fn resell_ticket<'a>(
        &'a self,
        resale: &'a Resale,
        origin: &'a Origin,
    ) -> BoxFuture<'a, Result<Outcome>>;

    fn cancel_listing<'a>(&'a self, ticket_id: u64, origin: &'a Origin)
        -> BoxFuture<'a, Result<Outcome>>;

    /// Marks a ticket used. This is a one-way latch.
    fn use_ticket<'a>(&'a self, usage: &'a Usage, origin: &'a Origin)
        -> BoxFuture<'a, Result<Outcome>>;

    /// Returns the explicitly stored checkpoint.
    fn checkpoint(&self) -> BoxFuture<'_, Result<Option<u64>>>;

    /// Returns the highest block number in the transaction audit trail.
    fn latest_transaction_block(&self) -> BoxFuture<'_, Result<Option<u64>>>;

    /// Raises the checkpoint to `block`. Never lowers it. Returns the stored
    /// checkpoint.
    fn advance_checkpoint(&self, block: u64) -> BoxFuture<'_, Result<u64>>;

    /// Returns the last block fully scanned for the specified event.
    fn scan_cursor<'a>(&'a self, event: &'a str) -> BoxFuture<'a, Result<Option<u64>>>;

    /// Raises the scan cursor for the specified event. Never lowers it.
    fn set_scan_cursor<'a>(&'a self, event: &'a str, block: u64) -> BoxFuture<'a, Result<()>>;

    fn event(&self, event_id: u64) -> BoxFuture<'_, Result<Option<Event>>>;

    fn events_by_creator<'a>(&'a self, creator: &'a str) -> BoxFuture<'a, Result<Vec<Event>>>;

    fn ticket_types(&self, event_id: u64) -> BoxFuture<'_, Result<Vec<TicketType>>>;

    fn ticket_type(&self, event_id: u64, type_id: u64)
        -> BoxFuture<'_, Result<Option<TicketType>>>;

    fn ticket(&self, ticket_id: u64) -> BoxFuture<'_, Result<Option<Ticket>>>;

    fn user<'a>(&'a self, address: &'a str) -> BoxFuture<'a, Result<Option<User>>>;

    fn user_tickets<'a>(&'a self, owner: &'a str) -> BoxFuture<'a, Result<Vec<Ticket>>>;

    /// Tickets currently listed for resale, optionally restricted to one
    /// event.
    fn resale_listings(&self, event_id: Option<u64>) -> BoxFuture<'_, Result<Vec<Ticket>>>;

    /// Tickets minted by the specified purchase transaction.
    fn purchase_tickets<'a>(&'a self, tx_hash: &'a str) -> BoxFuture<'a, Result<Vec<Ticket>>>;

    /// Audit trail entries where the address is sender or recipient, newest
    /// first.
    fn user_transactions<'a>(&'a self, address: &'a str)
        -> BoxFuture<'a, Result<Vec<Transaction>>>;

    /// Audit trail entries of the specified kind, oldest first.
    fn transactions_by_kind(
        &self,
        kind: TransactionKind,
    ) -> BoxFuture<'_, Result<Vec<Transaction>>>;

    fn revenue_shares(&self, event_id: u64) -> BoxFuture<'_, Result<Vec<RevenueShare>>>;
}

/// An audit trail entry about to be written for a mutation's [`Origin`].
struct AuditEntry<'a> {
    kind: TransactionKind,
    from: Option<&'a str>,
    to: Option<&'a str>,
    amount: &'a str,
    event_id: Option<u64>,
    ticket_id: Option<u64>,
}

/// Converts an unsigned integer into the signed representation SQL backends
/// use for `INTEGER`/`BIGINT` columns.
fn int(value: u64, what: &str) -> Result<i64> {
    i64::try_from(value).with_context(|| format!("{what} out of bounds"))
}

fn uint(value: i64, what: &str) -> Result<u64> {
    u64::try_from(value).with_context(|| format!("{what} out of bounds"))
}

/// The parts of a ticket row that ownership and listing mutations check.
struct TicketState {
    owner: String,
    /// Chain position of the log that used the ticket.
    used: Option<(u64, u64)>,
}

impl TicketState {
    /// Whether the ticket was already used when the log at `origin` was
    /// emitted. Logs older than the use still apply when they arrive late.
    fn used_before(&self, origin: &Origin) -> bool {
        self.used
            .is_some_and(|used| used <= (origin.block_number, origin.log_index))
    }
}

/// Sold counter attribution for one (transaction, ticket type) pair: the
/// counter is credited with the larger of the minted and purchased counts.
/// Returns the additional credit to apply.
fn credit_delta(minted: u64, purchased: u64, credited: u64) -> u64 {
    minted.max(purchased).saturating_sub(credited)
}
