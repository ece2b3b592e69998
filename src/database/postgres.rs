use crate::database::{
    credit_delta, int, uint, AuditEntry, Database, Event, EventStatus, Listing, Mint, NewEvent,
    NewTicketType, Origin, Outcome, Purchase, Resale, RevenueShare, Role, Ticket, TicketState,
    TicketType, TicketTypeUpdate, Transaction, TransactionKind, Usage, User,
};
use anyhow::{Context, Result};
use futures::{future::BoxFuture, FutureExt};
use tokio::sync::Mutex;
use tokio_postgres::{types::ToSql, Client, Row};

type PgTransaction<'a> = tokio_postgres::Transaction<'a>;

pub struct Postgres {
    client: Mutex<Client>,
}

impl Postgres {
    pub async fn connect(params: &str) -> Result<Self> {
        tracing::debug!("opening postgres database");
        let (client, connection) = tokio_postgres::connect(params, tokio_postgres::NoTls)
            .await
            .context("connect client")?;

        // The connection object performs the actual communication with the database,
        // so spawn it off to run on its own.
        tokio::spawn(async move {
            if let Err(err) = connection.await {
                tracing::error!(%err, "postgres connection error");
            }
        });

        client
            .batch_execute(SCHEMA)
            .await
            .context("create schema")?;

        Ok(Self {
            client: Mutex::new(client),
        })
    }
}

impl Database for Postgres {
    fn create_event<'a>(
        &'a self,
        event: &'a NewEvent,
        shares: &'a [RevenueShare],
        origin: &'a Origin,
    ) -> BoxFuture<'a, Result<Outcome>> {
        async move {
            let mut client = self.client.lock().await;
            let transaction = client.transaction().await.context("transaction")?;

            upsert_user(&transaction, &event.creator, Role::Organizer, origin).await?;
            let event_id = int(event.event_id, "event id")?;
            let inserted = transaction
                .execute(
                    INSERT_EVENT,
                    &[
                        &event_id,
                        &event.creator,
                        &event.name,
                        &event.event_uri,
                        &event.document_uri,
                        &int(event.event_date, "event date")?,
                        &event.event_active,
                        &int(event.created_at, "created at")?,
                        &origin.tx_hash,
                        &int(origin.block_number, "block")?,
                    ],
                )
                .await
                .context("execute INSERT_EVENT")?
                == 1;
            for share in shares {
                transaction
                    .execute(
                        INSERT_REVENUE_SHARE,
                        &[
                            &event_id,
                            &share.beneficiary,
                            &int(share.percentage, "percentage")?,
                        ],
                    )
                    .await
                    .context("execute INSERT_REVENUE_SHARE")?;
            }
            insert_transaction(
                &transaction,
                &AuditEntry {
                    kind: TransactionKind::EventCreation,
                    from: Some(&event.creator),
                    to: None,
                    amount: "0",
                    event_id: Some(event.event_id),
                    ticket_id: None,
                },
                origin,
            )
            .await?;

            transaction.commit().await.context("commit")?;
            Ok(if inserted {
                Outcome::Applied
            } else {
                Outcome::Duplicate
            })
        }
        .boxed()
    }

    fn set_event_status<'a>(
        &'a self,
        event_id: u64,
        status: EventStatus,
        creator: &'a str,
        origin: &'a Origin,
    ) -> BoxFuture<'a, Result<Outcome>> {
        async move {
            let mut client = self.client.lock().await;
            let transaction = client.transaction().await.context("transaction")?;

            let id = int(event_id, "event id")?;
            let approved_at = match status {
                EventStatus::Approved => Some(int(origin.timestamp, "timestamp")?),
                _ => None,
            };
            let changed = transaction
                .execute(SET_EVENT_STATUS, &[&id, &status.as_str(), &approved_at])
                .await
                .context("execute SET_EVENT_STATUS")?;
            if changed == 0 {
                let current = transaction
                    .query_opt(GET_EVENT_STATUS, &[&id])
                    .await
                    .context("query GET_EVENT_STATUS")?
                    .map(|row| row.try_get::<_, String>(0))
                    .transpose()?;
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
                &transaction,
                &AuditEntry {
                    kind,
                    from: Some(creator),
                    to: None,
                    amount: "0",
                    event_id: Some(event_id),
                    ticket_id: None,
                },
                origin,
            )
            .await?;

            transaction.commit().await.context("commit")?;
            Ok(Outcome::Applied)
        }
        .boxed()
    }

    fn add_ticket_type<'a>(
        &'a self,
        ticket_type: &'a NewTicketType,
        origin: &'a Origin,
    ) -> BoxFuture<'a, Result<Outcome>> {
        async move {
            let mut client = self.client.lock().await;
            let transaction = client.transaction().await.context("transaction")?;

            let event_id = int(ticket_type.event_id, "event id")?;
            let type_id = int(ticket_type.type_id, "type id")?;
            let credited: i64 = transaction
                .query_one(CREDITED_SOLD, &[&event_id, &type_id])
                .await
                .context("query CREDITED_SOLD")?
                .try_get(0)?;
            let inserted = transaction
                .execute(
                    INSERT_TICKET_TYPE,
                    &[
                        &event_id,
                        &type_id,
                        &ticket_type.name,
                        &ticket_type.price,
                        &int(ticket_type.total_supply, "total supply")?,
                        &credited,
                        &int(ticket_type.sale_start, "sale start")?,
                        &int(ticket_type.sale_end, "sale end")?,
                        &ticket_type.active,
                        &int(origin.block_number, "block")?,
                        &int(origin.log_index, "log index")?,
                    ],
                )
                .await
                .context("execute INSERT_TICKET_TYPE")?
                == 1;
            transaction
                .execute(ACTIVATE_EVENT, &[&event_id])
                .await
                .context("execute ACTIVATE_EVENT")?;

            let creator = event_creator(&transaction, event_id).await?;
            insert_transaction(
                &transaction,
                &AuditEntry {
                    kind: TransactionKind::TicketTypeAdded,
                    from: creator.as_deref(),
                    to: None,
                    amount: "0",
                    event_id: Some(ticket_type.event_id),
                    ticket_id: None,
                },
                origin,
            )
            .await?;

            transaction.commit().await.context("commit")?;
            Ok(if inserted {
                Outcome::Applied
            } else {
                Outcome::Duplicate
            })
        }
        .boxed()
    }

    fn update_ticket_type<'a>(
        &'a self,
        update: &'a TicketTypeUpdate,
        origin: &'a Origin,
    ) -> BoxFuture<'a, Result<Outcome>> {
        async move {
            let mut client = self.client.lock().await;
            let transaction = client.transaction().await.context("transaction")?;

            let event_id = int(update.event_id, "event id")?;
            let type_id = int(update.type_id, "type id")?;
            let changed = transaction
                .execute(
                    UPDATE_TICKET_TYPE,
                    &[
                        &event_id,
                        &type_id,
                        &update.price,
                        &int(update.total_supply, "total supply")?,
                        &int(update.sale_start, "sale start")?,
                        &int(update.sale_end, "sale end")?,
                        &update.active,
                        &int(origin.block_number, "block")?,
                        &int(origin.log_index, "log index")?,
                    ],
                )
                .await
                .context("execute UPDATE_TICKET_TYPE")?;
            if changed == 0 {
                let exists: bool = transaction
                    .query_one(TICKET_TYPE_EXISTS, &[&event_id, &type_id])
                    .await
                    .context("query TICKET_TYPE_EXISTS")?
                    .try_get(0)?;
                return Ok(if exists {
                    Outcome::Duplicate
                } else {
                    Outcome::Missing("ticket type")
                });
            }

            let creator = event_creator(&transaction, event_id).await?;
            insert_transaction(
                &transaction,
                &AuditEntry {
                    kind: TransactionKind::TicketTypeUpdated,
                    from: creator.as_deref(),
                    to: None,
                    amount: "0",
                    event_id: Some(update.event_id),
                    ticket_id: None,
                },
                origin,
            )
            .await?;

            transaction.commit().await.context("commit")?;
            Ok(Outcome::Applied)
        }
        .boxed()
    }

    fn mint_ticket<'a>(
        &'a self,
        mint: &'a Mint,
        origin: &'a Origin,
    ) -> BoxFuture<'a, Result<Outcome>> {
        async move {
            let mut client = self.client.lock().await;
            let transaction = client.transaction().await.context("transaction")?;

            let inserted = transaction
                .execute(
                    INSERT_TICKET,
                    &[
                        &int(mint.ticket_id, "ticket id")?,
                        &int(mint.event_id, "event id")?,
                        &int(mint.type_id, "type id")?,
                        &mint.owner,
                        &int(origin.timestamp, "timestamp")?,
                        &origin.tx_hash,
                        &int(origin.block_number, "block")?,
                        &int(origin.log_index, "log index")?,
                    ],
                )
                .await
                .context("execute INSERT_TICKET")?
                == 1;
            if !inserted {
                return Ok(Outcome::Duplicate);
            }

            upsert_user(&transaction, &mint.owner, Role::Buyer, origin).await?;
            credit(
                &transaction,
                &origin.tx_hash,
                mint.event_id,
                mint.type_id,
                1,
                0,
            )
            .await?;

            transaction.commit().await.context("commit")?;
            Ok(Outcome::Applied)
        }
        .boxed()
    }

    fn record_purchase<'a>(
        &'a self,
        purchase: &'a Purchase,
        origin: &'a Origin,
    ) -> BoxFuture<'a, Result<Outcome>> {
        async move {
            let mut client = self.client.lock().await;
            let transaction = client.transaction().await.context("transaction")?;

            let inserted = insert_transaction(
                &transaction,
                &AuditEntry {
                    kind: TransactionKind::TicketPurchase,
                    from: Some(&purchase.buyer),
                    to: None,
                    amount: &purchase.total_cost,
                    event_id: Some(purchase.event_id),
                    ticket_id: None,
                },
                origin,
            )
            .await?;
            if !inserted {
                return Ok(Outcome::Duplicate);
            }

            upsert_user(&transaction, &purchase.buyer, Role::Buyer, origin).await?;
            credit(
                &transaction,
                &origin.tx_hash,
                purchase.event_id,
                purchase.type_id,
                0,
                purchase.quantity,
            )
            .await?;

            transaction.commit().await.context("commit")?;
            Ok(Outcome::Applied)
        }
        .boxed()
    }

    fn list_ticket<'a>(
        &'a self,
        listing: &'a Listing,
        origin: &'a Origin,
    ) -> BoxFuture<'a, Result<Outcome>> {
        async move {
            let mut client = self.client.lock().await;
            let transaction = client.transaction().await.context("transaction")?;

            let ticket_id = int(listing.ticket_id, "ticket id")?;
            let state = match ticket_state(&transaction, ticket_id).await? {
                None => return Ok(Outcome::Missing("ticket")),
                Some(state) if state.used_before(origin) => {
                    return Ok(Outcome::Ignored("ticket already used"))
                }
                Some(state) => state,
            };
            let changed = transaction
                .execute(
                    LIST_TICKET,
                    &[
                        &ticket_id,
                        &listing.price,
                        &int(listing.deadline, "deadline")?,
                        &int(origin.block_number, "block")?,
                        &int(origin.log_index, "log index")?,
                    ],
                )
                .await
                .context("execute LIST_TICKET")?;
            insert_transaction(
                &transaction,
                &AuditEntry {
                    kind: TransactionKind::TicketResaleListing,
                    from: Some(&state.owner),
                    to: None,
                    amount: &listing.price,
                    event_id: None,
                    ticket_id: Some(listing.ticket_id),
                },
                origin,
            )
            .await?;

            transaction.commit().await.context("commit")?;
            Ok(if changed == 0 {
                Outcome::Duplicate
            } else {
                Outcome::Applied
            })
        }
        .boxed()
    }

    fn resell_ticket<'a>(
        &'a self,
        resale: &'a Resale,
        origin: &'a Origin,
    ) -> BoxFuture<'a, Result<Outcome>> {
        async move {
            let mut client = self.client.lock().await;
            let transaction = client.transaction().await.context("transaction")?;

            let ticket_id = int(resale.ticket_id, "ticket id")?;
            match ticket_state(&transaction, ticket_id).await? {
                None => return Ok(Outcome::Missing("ticket")),
                Some(state) if state.used_before(origin) => {
                    return Ok(Outcome::Ignored("ticket already used"))
                }
                Some(_) => {}
            }
            let inserted = insert_transaction(
                &transaction,
                &AuditEntry {
                    kind: TransactionKind::TicketResale,
                    from: Some(&resale.from),
                    to: Some(&resale.to),
                    amount: &resale.price,
                    event_id: None,
                    ticket_id: Some(resale.ticket_id),
                },
                origin,
            )
            .await?;
            if !inserted {
                return Ok(Outcome::Duplicate);
            }

            let block = int(origin.block_number, "block")?;
            let log_index = int(origin.log_index, "log index")?;
            upsert_user(&transaction, &resale.to, Role::Buyer, origin).await?;
            transaction
                .execute(TRANSFER_TICKET, &[&ticket_id, &resale.to, &block, &log_index])
                .await
                .context("execute TRANSFER_TICKET")?;
            transaction
                .execute(CLEAR_LISTING, &[&ticket_id, &block, &log_index])
                .await
                .context("execute CLEAR_LISTING")?;
            transaction
                .execute(COUNT_RESALE, &[&ticket_id])
                .await
                .context("execute COUNT_RESALE")?;

            transaction.commit().await.context("commit")?;
            Ok(Outcome::Applied)
        }
        .boxed()
    }

    fn cancel_listing<'a>(
        &'a self,
        ticket_id: u64,
        origin: &'a Origin,
    ) -> BoxFuture<'a, Result<Outcome>> {
        async move {
            let mut client = self.client.lock().await;
            let transaction = client.transaction().await.context("transaction")?;

            let id = int(ticket_id, "ticket id")?;
            let state = match ticket_state(&transaction, id).await? {
                None => return Ok(Outcome::Missing("ticket")),
                Some(state) if state.used_before(origin) => {
                    return Ok(Outcome::Ignored("ticket already used"))
                }
                Some(state) => state,
            };
            let changed = transaction
                .execute(
                    CLEAR_LISTING,
                    &[
                        &id,
                        &int(origin.block_number, "block")?,
                        &int(origin.log_index, "log index")?,
                    ],
                )
                .await
                .context("execute CLEAR_LISTING")?;
            insert_transaction(
                &transaction,
                &AuditEntry {
                    kind: TransactionKind::TicketResaleCancelled,
                    from: Some(&state.owner),
                    to: None,
                    amount: "0",
                    event_id: None,
                    ticket_id: Some(ticket_id),
                },
                origin,
            )
            .await?;

            transaction.commit().await.context("commit")?;
            Ok(if changed == 0 {
                Outcome::Duplicate
            } else {
                Outcome::Applied
            })
        }
        .boxed()
    }

    fn use_ticket<'a>(
        &'a self,
        usage: &'a Usage,
        origin: &'a Origin,
    ) -> BoxFuture<'a, Result<Outcome>> {
        async move {
            let mut client = self.client.lock().await;
            let transaction = client.transaction().await.context("transaction")?;

            let id = int(usage.ticket_id, "ticket id")?;
            let changed = transaction
                .execute(
                    USE_TICKET,
                    &[
                        &id,
                        &int(origin.timestamp, "timestamp")?,
                        &int(origin.block_number, "block")?,
                        &int(origin.log_index, "log index")?,
                    ],
                )
                .await
                .context("execute USE_TICKET")?;
            if changed == 0 {
                return Ok(match ticket_state(&transaction, id).await? {
                    None => Outcome::Missing("ticket"),
                    Some(_) => Outcome::Duplicate,
                });
            }

            upsert_user(&transaction, &usage.user, Role::Buyer, origin).await?;
            insert_transaction(
                &transaction,
                &AuditEntry {
                    kind: TransactionKind::TicketUse,
                    from: Some(&usage.user),
                    to: None,
                    amount: "0",
                    event_id: Some(usage.event_id),
                    ticket_id: Some(usage.ticket_id),
                },
                origin,
            )
            .await?;

            transaction.commit().await.context("commit")?;
            Ok(Outcome::Applied)
        }
        .boxed()
    }

    fn checkpoint(&self) -> BoxFuture<'_, Result<Option<u64>>> {
        async move {
            let client = self.client.lock().await;
            client
                .query_opt(GET_CHECKPOINT, &[])
                .await
                .context("query GET_CHECKPOINT")?
                .map(|row| uint(row.try_get(0)?, "checkpoint"))
                .transpose()
        }
        .boxed()
    }

    fn latest_transaction_block(&self) -> BoxFuture<'_, Result<Option<u64>>> {
        async move {
            let client = self.client.lock().await;
            let block: Option<i64> = client
                .query_one(LATEST_TRANSACTION_BLOCK, &[])
                .await
                .context("query LATEST_TRANSACTION_BLOCK")?
                .try_get(0)?;
            block.map(|block| uint(block, "block")).transpose()
        }
        .boxed()
    }

    fn advance_checkpoint(&self, block: u64) -> BoxFuture<'_, Result<u64>> {
        async move {
            let client = self.client.lock().await;
            let stored: i64 = client
                .query_one(ADVANCE_CHECKPOINT, &[&int(block, "checkpoint")?])
                .await
                .context("query ADVANCE_CHECKPOINT")?
                .try_get(0)?;
            uint(stored, "checkpoint")
        }
        .boxed()
    }

    fn scan_cursor<'a>(&'a self, event: &'a str) -> BoxFuture<'a, Result<Option<u64>>> {
        async move {
            let client = self.client.lock().await;
            client
                .query_opt(GET_SCAN_CURSOR, &[&event])
                .await
                .context("query GET_SCAN_CURSOR")?
                .map(|row| uint(row.try_get(0)?, "scan cursor"))
                .transpose()
        }
        .boxed()
    }

    fn set_scan_cursor<'a>(&'a self, event: &'a str, block: u64) -> BoxFuture<'a, Result<()>> {
        async move {
            let client = self.client.lock().await;
            client
                .execute(SET_SCAN_CURSOR, &[&event, &int(block, "scan cursor")?])
                .await
                .context("execute SET_SCAN_CURSOR")?;
            Ok(())
        }
        .boxed()
    }

    fn event(&self, event_id: u64) -> BoxFuture<'_, Result<Option<Event>>> {
        async move {
            let id = int(event_id, "event id")?;
            self.query_opt(GET_EVENT, &[&id], event_row).await
        }
        .boxed()
    }

    fn events_by_creator<'a>(&'a self, creator: &'a str) -> BoxFuture<'a, Result<Vec<Event>>> {
        async move {
            let creator = creator.to_ascii_lowercase();
            self.query(EVENTS_BY_CREATOR, &[&creator], event_row).await
        }
        .boxed()
    }

    fn ticket_types(&self, event_id: u64) -> BoxFuture<'_, Result<Vec<TicketType>>> {
        async move {
            let id = int(event_id, "event id")?;
            self.query(TICKET_TYPES, &[&id], ticket_type_row).await
        }
        .boxed()
    }

    fn ticket_type(
        &self,
        event_id: u64,
        type_id: u64,
    ) -> BoxFuture<'_, Result<Option<TicketType>>> {
        async move {
            let event_id = int(event_id, "event id")?;
            let type_id = int(type_id, "type id")?;
            self.query_opt(GET_TICKET_TYPE, &[&event_id, &type_id], ticket_type_row)
                .await
        }
        .boxed()
    }

    fn ticket(&self, ticket_id: u64) -> BoxFuture<'_, Result<Option<Ticket>>> {
        async move {
            let id = int(ticket_id, "ticket id")?;
            self.query_opt(GET_TICKET, &[&id], ticket_row).await
        }
        .boxed()
    }

    fn user<'a>(&'a self, address: &'a str) -> BoxFuture<'a, Result<Option<User>>> {
        async move {
            let address = address.to_ascii_lowercase();
            self.query_opt(GET_USER, &[&address], user_row).await
        }
        .boxed()
    }

    fn user_tickets<'a>(&'a self, owner: &'a str) -> BoxFuture<'a, Result<Vec<Ticket>>> {
        async move {
            let owner = owner.to_ascii_lowercase();
            self.query(USER_TICKETS, &[&owner], ticket_row).await
        }
        .boxed()
    }

    fn resale_listings(&self, event_id: Option<u64>) -> BoxFuture<'_, Result<Vec<Ticket>>> {
        async move {
            let event_id = event_id.map(|id| int(id, "event id")).transpose()?;
            self.query(RESALE_LISTINGS, &[&event_id], ticket_row).await
        }
        .boxed()
    }

    fn purchase_tickets<'a>(&'a self, tx_hash: &'a str) -> BoxFuture<'a, Result<Vec<Ticket>>> {
        async move {
            let tx_hash = tx_hash.to_ascii_lowercase();
            self.query(PURCHASE_TICKETS, &[&tx_hash], ticket_row).await
        }
        .boxed()
    }

    fn user_transactions<'a>(
        &'a self,
        address: &'a str,
    ) -> BoxFuture<'a, Result<Vec<Transaction>>> {
        async move {
            let address = address.to_ascii_lowercase();
            self.query(USER_TRANSACTIONS, &[&address], transaction_row)
                .await
        }
        .boxed()
    }

    fn transactions_by_kind(
        &self,
        kind: TransactionKind,
    ) -> BoxFuture<'_, Result<Vec<Transaction>>> {
        async move {
            self.query(TRANSACTIONS_BY_KIND, &[&kind.as_str()], transaction_row)
                .await
        }
        .boxed()
    }

    fn revenue_shares(&self, event_id: u64) -> BoxFuture<'_, Result<Vec<RevenueShare>>> {
        async move {
            let id = int(event_id, "event id")?;
            self.query(REVENUE_SHARES, &[&id], |row| {
                Ok(RevenueShare {
                    beneficiary: row.try_get(0)?,
                    percentage: uint(row.try_get(1)?, "percentage")?,
                })
            })
            .await
        }
        .boxed()
    }
}

impl Postgres {
    async fn query<T>(
        &self,
        sql: &str,
        params: &[&(dyn ToSql + Sync)],
        map: impl Fn(&Row) -> Result<T>,
    ) -> Result<Vec<T>> {
        let client = self.client.lock().await;
        let rows = client.query(sql, params).await.context("query")?;
        rows.iter().map(map).collect()
    }

    async fn query_opt<T>(
        &self,
        sql: &str,
        params: &[&(dyn ToSql + Sync)],
        map: impl Fn(&Row) -> Result<T>,
    ) -> Result<Option<T>> {
        let client = self.client.lock().await;
        let row = client.query_opt(sql, params).await.context("query")?;
        row.as_ref().map(map).transpose()
    }
}

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS users(address TEXT PRIMARY KEY NOT NULL, role TEXT NOT NULL, created_block BIGINT NOT NULL);
CREATE TABLE IF NOT EXISTS events(event_id BIGINT PRIMARY KEY NOT NULL, creator TEXT NOT NULL, name TEXT NOT NULL, event_uri TEXT NOT NULL, document_uri TEXT NOT NULL, event_date BIGINT NOT NULL, event_active BOOLEAN NOT NULL, status TEXT NOT NULL, created_at BIGINT NOT NULL, approved_at BIGINT, tx_hash TEXT NOT NULL, block_number BIGINT NOT NULL);
CREATE INDEX IF NOT EXISTS events_creator ON events(creator);
CREATE TABLE IF NOT EXISTS revenue_shares(event_id BIGINT NOT NULL, beneficiary TEXT NOT NULL, percentage BIGINT NOT NULL, PRIMARY KEY(event_id, beneficiary));
CREATE TABLE IF NOT EXISTS ticket_types(event_id BIGINT NOT NULL, type_id BIGINT NOT NULL, name TEXT NOT NULL, price NUMERIC(78, 0) NOT NULL, total_supply BIGINT NOT NULL, sold BIGINT NOT NULL, sale_start BIGINT NOT NULL, sale_end BIGINT NOT NULL, active BOOLEAN NOT NULL, updated_block BIGINT NOT NULL, updated_log_index BIGINT NOT NULL, PRIMARY KEY(event_id, type_id));
CREATE TABLE IF NOT EXISTS tickets(ticket_id BIGINT PRIMARY KEY NOT NULL, event_id BIGINT NOT NULL, type_id BIGINT NOT NULL, owner TEXT NOT NULL, is_used BOOLEAN NOT NULL DEFAULT FALSE, used_at BIGINT, minted_at BIGINT NOT NULL, is_for_resale BOOLEAN NOT NULL DEFAULT FALSE, resale_price NUMERIC(78, 0), resale_deadline BIGINT, resale_count BIGINT NOT NULL DEFAULT 0, tx_hash TEXT NOT NULL, owner_block BIGINT NOT NULL, owner_log_index BIGINT NOT NULL, listing_block BIGINT NOT NULL, listing_log_index BIGINT NOT NULL, used_block BIGINT, used_log_index BIGINT);
CREATE INDEX IF NOT EXISTS tickets_owner ON tickets(owner);
CREATE INDEX IF NOT EXISTS tickets_tx_hash ON tickets(tx_hash);
CREATE TABLE IF NOT EXISTS transactions(tx_hash TEXT NOT NULL, log_index BIGINT NOT NULL, kind TEXT NOT NULL, sender TEXT, recipient TEXT, amount NUMERIC(78, 0) NOT NULL, event_id BIGINT, ticket_id BIGINT, block_number BIGINT NOT NULL, timestamp BIGINT NOT NULL, PRIMARY KEY(tx_hash, log_index));
CREATE INDEX IF NOT EXISTS transactions_block ON transactions(block_number);
CREATE TABLE IF NOT EXISTS purchase_credits(tx_hash TEXT NOT NULL, event_id BIGINT NOT NULL, type_id BIGINT NOT NULL, minted BIGINT NOT NULL DEFAULT 0, purchased BIGINT NOT NULL DEFAULT 0, credited BIGINT NOT NULL DEFAULT 0, PRIMARY KEY(tx_hash, event_id, type_id));
CREATE TABLE IF NOT EXISTS _checkpoint(id BIGINT PRIMARY KEY NOT NULL CHECK(id = 0), block BIGINT NOT NULL);
CREATE TABLE IF NOT EXISTS _scan_cursor(event TEXT PRIMARY KEY NOT NULL, block BIGINT NOT NULL);
";

// Amounts travel as text and are cast to and from `NUMERIC` in SQL.

const UPSERT_USER: &str = "INSERT INTO users(address, role, created_block) VALUES($1, $2, $3) \
                           ON CONFLICT(address) DO NOTHING;";
const INSERT_TRANSACTION: &str = "INSERT INTO transactions(tx_hash, log_index, kind, sender, \
                                  recipient, amount, event_id, ticket_id, block_number, \
                                  timestamp) VALUES($1, $2, $3, $4, $5, $6::TEXT::NUMERIC, $7, \
                                  $8, $9, $10) ON CONFLICT(tx_hash, log_index) DO NOTHING;";

const INSERT_EVENT: &str = "INSERT INTO events(event_id, creator, name, event_uri, document_uri, \
                            event_date, event_active, status, created_at, tx_hash, \
                            block_number) VALUES($1, $2, $3, $4, $5, $6, $7, 'PENDING', $8, $9, \
                            $10) ON CONFLICT(event_id) DO NOTHING;";
const INSERT_REVENUE_SHARE: &str = "INSERT INTO revenue_shares(event_id, beneficiary, \
                                    percentage) VALUES($1, $2, $3) ON CONFLICT(event_id, \
                                    beneficiary) DO NOTHING;";
const SET_EVENT_STATUS: &str = "UPDATE events SET status = $2, approved_at = COALESCE($3, \
                                approved_at) WHERE event_id = $1 AND status = 'PENDING';";
const GET_EVENT_STATUS: &str = "SELECT status FROM events WHERE event_id = $1;";
const GET_EVENT_CREATOR: &str = "SELECT creator FROM events WHERE event_id = $1;";
const ACTIVATE_EVENT: &str = "UPDATE events SET event_active = TRUE WHERE event_id = $1;";

const CREDITED_SOLD: &str = "SELECT COALESCE(SUM(credited), 0)::BIGINT FROM purchase_credits \
                             WHERE event_id = $1 AND type_id = $2;";
const INSERT_TICKET_TYPE: &str = "INSERT INTO ticket_types(event_id, type_id, name, price, \
                                  total_supply, sold, sale_start, sale_end, active, \
                                  updated_block, updated_log_index) VALUES($1, $2, $3, \
                                  $4::TEXT::NUMERIC, $5, $6, $7, $8, $9, $10, $11) ON \
                                  CONFLICT(event_id, type_id) DO NOTHING;";
const UPDATE_TICKET_TYPE: &str = "UPDATE ticket_types SET price = $3::TEXT::NUMERIC, \
                                  total_supply = $4, sale_start = $5, sale_end = $6, active = \
                                  $7, updated_block = $8, updated_log_index = $9 WHERE event_id \
                                  = $1 AND type_id = $2 AND (updated_block, updated_log_index) \
                                  < ($8, $9);";
const TICKET_TYPE_EXISTS: &str =
    "SELECT COUNT(*) > 0 FROM ticket_types WHERE event_id = $1 AND type_id = $2;";

const NEW_CREDIT: &str = "INSERT INTO purchase_credits(tx_hash, event_id, type_id) VALUES($1, \
                          $2, $3) ON CONFLICT(tx_hash, event_id, type_id) DO NOTHING;";
const ADD_CREDIT: &str = "UPDATE purchase_credits SET minted = minted + $4, purchased = \
                          purchased + $5 WHERE tx_hash = $1 AND event_id = $2 AND type_id = $3 \
                          RETURNING minted, purchased, credited;";
const SET_CREDITED: &str = "UPDATE purchase_credits SET credited = $4 WHERE tx_hash = $1 AND \
                            event_id = $2 AND type_id = $3;";
const ADD_SOLD: &str =
    "UPDATE ticket_types SET sold = sold + $3 WHERE event_id = $1 AND type_id = $2;";

const INSERT_TICKET: &str = "INSERT INTO tickets(ticket_id, event_id, type_id, owner, \
                             minted_at, tx_hash, owner_block, owner_log_index, listing_block, \
                             listing_log_index) VALUES($1, $2, $3, $4, $5, $6, $7, $8, $7, $8) \
                             ON CONFLICT(ticket_id) DO NOTHING;";
const GET_TICKET_STATE: &str =
    "SELECT owner, used_block, used_log_index FROM tickets WHERE ticket_id = $1 FOR UPDATE;";
const LIST_TICKET: &str = "UPDATE tickets SET is_for_resale = TRUE, resale_price = \
                           $2::TEXT::NUMERIC, resale_deadline = $3, listing_block = $4, \
                           listing_log_index = $5 WHERE ticket_id = $1 AND NOT is_used AND \
                           (listing_block, listing_log_index) < ($4, $5);";
const CLEAR_LISTING: &str = "UPDATE tickets SET is_for_resale = FALSE, resale_price = NULL, \
                             resale_deadline = NULL, listing_block = $2, listing_log_index = $3 \
                             WHERE ticket_id = $1 AND NOT is_used AND (listing_block, \
                             listing_log_index) < ($2, $3);";
const TRANSFER_TICKET: &str = "UPDATE tickets SET owner = $2, owner_block = $3, owner_log_index \
                               = $4 WHERE ticket_id = $1 AND (owner_block, owner_log_index) < \
                               ($3, $4);";
const COUNT_RESALE: &str =
    "UPDATE tickets SET resale_count = resale_count + 1 WHERE ticket_id = $1;";
const USE_TICKET: &str = "UPDATE tickets SET is_used = TRUE, used_at = $2, used_block = $3, \
                          used_log_index = $4, is_for_resale = FALSE, resale_price = NULL, \
                          resale_deadline = NULL WHERE ticket_id = $1 AND NOT is_used;";

const GET_CHECKPOINT: &str = "SELECT block FROM _checkpoint WHERE id = 0;";
const ADVANCE_CHECKPOINT: &str = "INSERT INTO _checkpoint(id, block) VALUES(0, $1) ON \
                                  CONFLICT(id) DO UPDATE SET block = GREATEST(_checkpoint.block, \
                                  EXCLUDED.block) RETURNING block;";
const LATEST_TRANSACTION_BLOCK: &str = "SELECT MAX(block_number) FROM transactions;";
const GET_SCAN_CURSOR: &str = "SELECT block FROM _scan_cursor WHERE event = $1;";
const SET_SCAN_CURSOR: &str = "INSERT INTO _scan_cursor(event, block) VALUES($1, $2) ON \
                               CONFLICT(event) DO UPDATE SET block = \
                               GREATEST(_scan_cursor.block, EXCLUDED.block);";

const GET_EVENT: &str = "SELECT event_id, creator, name, event_uri, document_uri, event_date, \
                         event_active, status, created_at, approved_at, tx_hash, block_number \
                         FROM events WHERE event_id = $1;";
const EVENTS_BY_CREATOR: &str = "SELECT event_id, creator, name, event_uri, document_uri, \
                                 event_date, event_active, status, created_at, approved_at, \
                                 tx_hash, block_number FROM events WHERE creator = $1 ORDER BY \
                                 event_id;";
const TICKET_TYPES: &str = "SELECT event_id, type_id, name, price::TEXT, total_supply, sold, \
                            sale_start, sale_end, active FROM ticket_types WHERE event_id = $1 \
                            ORDER BY type_id;";
const GET_TICKET_TYPE: &str = "SELECT event_id, type_id, name, price::TEXT, total_supply, sold, \
                               sale_start, sale_end, active FROM ticket_types WHERE event_id = \
                               $1 AND type_id = $2;";
const GET_TICKET: &str = "SELECT ticket_id, event_id, type_id, owner, is_used, used_at, \
                          minted_at, is_for_resale, resale_price::TEXT, resale_deadline, \
                          resale_count, tx_hash FROM tickets WHERE ticket_id = $1;";
const USER_TICKETS: &str = "SELECT ticket_id, event_id, type_id, owner, is_used, used_at, \
                            minted_at, is_for_resale, resale_price::TEXT, resale_deadline, \
                            resale_count, tx_hash FROM tickets WHERE owner = $1 ORDER BY \
                            ticket_id;";
const RESALE_LISTINGS: &str = "SELECT ticket_id, event_id, type_id, owner, is_used, used_at, \
                               minted_at, is_for_resale, resale_price::TEXT, resale_deadline, \
                               resale_count, tx_hash FROM tickets WHERE is_for_resale AND \
                               ($1::BIGINT IS NULL OR event_id = $1) ORDER BY ticket_id;";
const PURCHASE_TICKETS: &str = "SELECT ticket_id, event_id, type_id, owner, is_used, used_at, \
                                minted_at, is_for_resale, resale_price::TEXT, resale_deadline, \
                                resale_count, tx_hash FROM tickets WHERE tx_hash = $1 ORDER BY \
                                ticket_id;";
const GET_USER: &str = "SELECT address, role, created_block FROM users WHERE address = $1;";
const USER_TRANSACTIONS: &str = "SELECT tx_hash, log_index, kind, sender, recipient, \
                                 amount::TEXT, event_id, ticket_id, block_number, timestamp \
                                 FROM transactions WHERE sender = $1 OR recipient = $1 ORDER BY \
                                 block_number DESC, log_index DESC;";
const TRANSACTIONS_BY_KIND: &str = "SELECT tx_hash, log_index, kind, sender, recipient, \
                                    amount::TEXT, event_id, ticket_id, block_number, timestamp \
                                    FROM transactions WHERE kind = $1 ORDER BY block_number, \
                                    log_index;";
const REVENUE_SHARES: &str = "SELECT beneficiary, percentage FROM revenue_shares WHERE event_id \
                              = $1 ORDER BY beneficiary;";

async fn upsert_user(
    transaction: &PgTransaction<'_>,
    address: &str,
    role: Role,
    origin: &Origin,
) -> Result<()> {
    transaction
        .execute(
            UPSERT_USER,
            &[&address, &role.as_str(), &int(origin.block_number, "block")?],
        )
        .await
        .context("execute UPSERT_USER")?;
    Ok(())
}

/// Appends an audit trail entry. Returns `false` if the entry for this log
/// already exists.
async fn insert_transaction(
    transaction: &PgTransaction<'_>,
    entry: &AuditEntry<'_>,
    origin: &Origin,
) -> Result<bool> {
    let event_id = entry.event_id.map(|id| int(id, "event id")).transpose()?;
    let ticket_id = entry.ticket_id.map(|id| int(id, "ticket id")).transpose()?;
    let rows = transaction
        .execute(
            INSERT_TRANSACTION,
            &[
                &origin.tx_hash,
                &int(origin.log_index, "log index")?,
                &entry.kind.as_str(),
                &entry.from,
                &entry.to,
                &entry.amount,
                &event_id,
                &ticket_id,
                &int(origin.block_number, "block")?,
                &int(origin.timestamp, "timestamp")?,
            ],
        )
        .await
        .context("execute INSERT_TRANSACTION")?;
    Ok(rows == 1)
}

/// Adds mint and purchase counts for a transaction and raises the type's sold
/// counter by whatever is not yet credited. The `UPDATE` locks the credit row
/// until the surrounding transaction ends.
async fn credit(
    transaction: &PgTransaction<'_>,
    tx_hash: &str,
    event_id: u64,
    type_id: u64,
    minted: u64,
    purchased: u64,
) -> Result<()> {
    let event_id = int(event_id, "event id")?;
    let type_id = int(type_id, "type id")?;
    transaction
        .execute(NEW_CREDIT, &[&tx_hash, &event_id, &type_id])
        .await
        .context("execute NEW_CREDIT")?;
    let row = transaction
        .query_one(
            ADD_CREDIT,
            &[
                &tx_hash,
                &event_id,
                &type_id,
                &int(minted, "minted")?,
                &int(purchased, "purchased")?,
            ],
        )
        .await
        .context("query ADD_CREDIT")?;
    let minted = uint(row.try_get(0)?, "minted")?;
    let purchased = uint(row.try_get(1)?, "purchased")?;
    let credited = uint(row.try_get(2)?, "credited")?;

    let delta = credit_delta(minted, purchased, credited);
    if delta == 0 {
        return Ok(());
    }
    transaction
        .execute(
            SET_CREDITED,
            &[&tx_hash, &event_id, &type_id, &int(credited + delta, "credited")?],
        )
        .await
        .context("execute SET_CREDITED")?;
    transaction
        .execute(ADD_SOLD, &[&event_id, &type_id, &int(delta, "sold")?])
        .await
        .context("execute ADD_SOLD")?;
    Ok(())
}

async fn event_creator(transaction: &PgTransaction<'_>, event_id: i64) -> Result<Option<String>> {
    transaction
        .query_opt(GET_EVENT_CREATOR, &[&event_id])
        .await
        .context("query GET_EVENT_CREATOR")?
        .map(|row| Ok(row.try_get(0)?))
        .transpose()
}

async fn ticket_state(transaction: &PgTransaction<'_>, ticket_id: i64) -> Result<Option<TicketState>> {
    transaction
        .query_opt(GET_TICKET_STATE, &[&ticket_id])
        .await
        .context("query GET_TICKET_STATE")?
        .map(|row| {
            let block: Option<i64> = row.try_get(1)?;
            let log_index: Option<i64> = row.try_get(2)?;
            Ok(TicketState {
                owner: row.try_get(0)?,
                used: match (block, log_index) {
                    (Some(block), Some(log_index)) => {
                        Some((uint(block, "block")?, uint(log_index, "log index")?))
                    }
                    _ => None,
                },
            })
        })
        .transpose()
}

fn optional_uint(value: Option<i64>, what: &str) -> Result<Option<u64>> {
    value.map(|value| uint(value, what)).transpose()
}

fn event_row(row: &Row) -> Result<Event> {
    Ok(Event {
        event_id: uint(row.try_get(0)?, "event id")?,
        creator: row.try_get(1)?,
        name: row.try_get(2)?,
        event_uri: row.try_get(3)?,
        document_uri: row.try_get(4)?,
        event_date: uint(row.try_get(5)?, "event date")?,
        event_active: row.try_get(6)?,
        status: row.try_get::<_, String>(7)?.parse()?,
        created_at: uint(row.try_get(8)?, "created at")?,
        approved_at: optional_uint(row.try_get(9)?, "approved at")?,
        tx_hash: row.try_get(10)?,
        block_number: uint(row.try_get(11)?, "block")?,
    })
}

fn ticket_type_row(row: &Row) -> Result<TicketType> {
    Ok(TicketType {
        event_id: uint(row.try_get(0)?, "event id")?,
        type_id: uint(row.try_get(1)?, "type id")?,
        name: row.try_get(2)?,
        price: row.try_get(3)?,
        total_supply: uint(row.try_get(4)?, "total supply")?,
        sold: uint(row.try_get(5)?, "sold")?,
        sale_start: uint(row.try_get(6)?, "sale start")?,
        sale_end: uint(row.try_get(7)?, "sale end")?,
        active: row.try_get(8)?,
    })
}

fn ticket_row(row: &Row) -> Result<Ticket> {
    Ok(Ticket {
        ticket_id: uint(row.try_get(0)?, "ticket id")?,
        event_id: uint(row.try_get(1)?, "event id")?,
        type_id: uint(row.try_get(2)?, "type id")?,
        owner: row.try_get(3)?,
        is_used: row.try_get(4)?,
        used_at: optional_uint(row.try_get(5)?, "used at")?,
        minted_at: uint(row.try_get(6)?, "minted at")?,
        is_for_resale: row.try_get(7)?,
        resale_price: row.try_get(8)?,
        resale_deadline: optional_uint(row.try_get(9)?, "resale deadline")?,
        resale_count: uint(row.try_get(10)?, "resale count")?,
        tx_hash: row.try_get(11)?,
    })
}

fn user_row(row: &Row) -> Result<User> {
    Ok(User {
        address: row.try_get(0)?,
        role: row.try_get::<_, String>(1)?.parse()?,
        created_block: uint(row.try_get(2)?, "created block")?,
    })
}

fn transaction_row(row: &Row) -> Result<Transaction> {
    Ok(Transaction {
        tx_hash: row.try_get(0)?,
        log_index: uint(row.try_get(1)?, "log index")?,
        kind: row.try_get::<_, String>(2)?.parse()?,
        from: row.try_get(3)?,
        to: row.try_get(4)?,
        amount: row.try_get(5)?,
        event_id: optional_uint(row.try_get(6)?, "event id")?,
        ticket_id: optional_uint(row.try_get(7)?, "ticket id")?,
        block_number: uint(row.try_get(8)?, "block")?,
        timestamp: uint(row.try_get(9)?, "timestamp")?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn local_postgres_url() -> String {
        format!("postgresql://{}@localhost", whoami::username())
    }

    async fn clear_database() -> Postgres {
        let postgres = Postgres::connect(&local_postgres_url()).await.unwrap();
        postgres
            .client
            .lock()
            .await
            .batch_execute(
                "TRUNCATE users, events, revenue_shares, ticket_types, tickets, transactions, \
                 purchase_credits, _checkpoint, _scan_cursor;",
            )
            .await
            .unwrap();
        postgres
    }

    fn origin(block: u64) -> Origin {
        Origin {
            tx_hash: format!("0x{block:064x}"),
            block_number: block,
            log_index: 0,
            timestamp: 1_700_000_000 + block * 12,
        }
    }

    #[ignore]
    #[tokio::test]
    async fn local_purchase_flow() {
        let postgres = clear_database().await;
        let buyer = "0x00000000000000000000000000000000000000b1";

        let ticket_type = NewTicketType {
            event_id: 7,
            type_id: 1,
            name: "GA".to_string(),
            price: "1000000000000000000000".to_string(),
            total_supply: 50,
            active: true,
            ..Default::default()
        };
        postgres.add_ticket_type(&ticket_type, &origin(105)).await.unwrap();
        let purchase = Purchase {
            event_id: 7,
            type_id: 1,
            buyer: buyer.to_string(),
            quantity: 3,
            total_cost: "3000000000000000000000".to_string(),
        };
        assert_eq!(
            postgres.record_purchase(&purchase, &origin(110)).await.unwrap(),
            Outcome::Applied
        );
        assert_eq!(
            postgres.record_purchase(&purchase, &origin(110)).await.unwrap(),
            Outcome::Duplicate
        );

        let stored = postgres.ticket_type(7, 1).await.unwrap().unwrap();
        assert_eq!(stored.sold, 3);
        assert_eq!(stored.price, ticket_type.price);
        let history = postgres.user_transactions(buyer).await.unwrap();
        assert_eq!(history[0].amount, purchase.total_cost);
    }

    #[ignore]
    #[tokio::test]
    async fn local_checkpoint() {
        let postgres = clear_database().await;
        assert_eq!(postgres.advance_checkpoint(100).await.unwrap(), 100);
        assert_eq!(postgres.advance_checkpoint(50).await.unwrap(), 100);
        assert_eq!(postgres.checkpoint().await.unwrap(), Some(100));
    }
}
