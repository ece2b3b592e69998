//! Turns decoded contract events into datastore mutations.

use crate::{
    contract::ContractReader,
    database::{self, Database, EventStatus, Origin, Outcome},
    decoder::ContractEvent,
};
use anyhow::{Context, Result};
use std::sync::Arc;

pub struct EventProcessor {
    database: Arc<dyn Database>,
    contract: Arc<dyn ContractReader>,
}

impl EventProcessor {
    pub fn new(database: Arc<dyn Database>, contract: Arc<dyn ContractReader>) -> Self {
        Self { database, contract }
    }

    /// Applies a single event. Errors are returned for failures worth
    /// retrying (contract reads, database errors); events that reference rows
    /// that do not exist are reported through the [`Outcome`] instead.
    pub async fn apply(&self, event: &ContractEvent, origin: &Origin) -> Result<Outcome> {
        let signature = event.signature();
        let outcome = self
            .dispatch(event, origin)
            .await
            .with_context(|| format!("failed to apply {signature} at block {}", origin.block_number))?;

        let (block, log_index) = (origin.block_number, origin.log_index);
        match outcome {
            Outcome::Applied => {
                tracing::debug!(%signature, %block, %log_index, "applied event");
            }
            Outcome::Duplicate => {
                tracing::debug!(%signature, %block, %log_index, "event already applied");
            }
            Outcome::Missing(row) => {
                tracing::warn!(%signature, %block, %log_index, %row, "skipping event for missing row");
            }
            Outcome::Ignored(reason) => {
                tracing::warn!(%signature, %block, %log_index, %reason, "ignoring event");
            }
        }
        Ok(outcome)
    }

    async fn dispatch(&self, event: &ContractEvent, origin: &Origin) -> Result<Outcome> {
        match event {
            ContractEvent::EventCreated {
                event_id,
                creator,
                name,
            } => {
                let details = self
                    .contract
                    .event_details(*event_id)
                    .await
                    .context("getEventDetails")?;
                let shares = self
                    .contract
                    .revenue_shares(*event_id)
                    .await
                    .context("getRevenueShares")?
                    .into_iter()
                    .map(|share| database::RevenueShare {
                        beneficiary: database::address(&share.beneficiary),
                        percentage: share.percentage,
                    })
                    .collect::<Vec<_>>();
                let event = database::NewEvent {
                    event_id: *event_id,
                    creator: database::address(creator),
                    name: name.clone(),
                    event_uri: details.event_uri,
                    document_uri: details.document_uri,
                    event_date: details.event_date,
                    event_active: details.event_active,
                    created_at: match details.created_at {
                        0 => origin.timestamp,
                        created_at => created_at,
                    },
                };
                self.database.create_event(&event, &shares, origin).await
            }
            ContractEvent::EventApproved { event_id, creator } => {
                let creator = database::address(creator);
                self.database
                    .set_event_status(*event_id, EventStatus::Approved, &creator, origin)
                    .await
            }
            ContractEvent::EventRejected { event_id, creator } => {
                let creator = database::address(creator);
                self.database
                    .set_event_status(*event_id, EventStatus::Rejected, &creator, origin)
                    .await
            }
            ContractEvent::TicketTypeAdded {
                event_id,
                type_id,
                name,
                price,
                supply,
            } => {
                let details = self
                    .contract
                    .ticket_type(*event_id, *type_id)
                    .await
                    .context("getTicketType")?;
                let ticket_type = database::NewTicketType {
                    event_id: *event_id,
                    type_id: *type_id,
                    name: name.clone(),
                    price: database::amount(price),
                    total_supply: *supply,
                    sale_start: details.sale_start,
                    sale_end: details.sale_end,
                    active: details.active,
                };
                self.database.add_ticket_type(&ticket_type, origin).await
            }
            ContractEvent::TicketTypeUpdated {
                event_id,
                type_id,
                price,
                supply,
            } => {
                let details = self
                    .contract
                    .ticket_type(*event_id, *type_id)
                    .await
                    .context("getTicketType")?;
                let update = database::TicketTypeUpdate {
                    event_id: *event_id,
                    type_id: *type_id,
                    price: database::amount(price),
                    total_supply: *supply,
                    sale_start: details.sale_start,
                    sale_end: details.sale_end,
                    active: details.active,
                };
                self.database.update_ticket_type(&update, origin).await
            }
            ContractEvent::TicketMinted {
                ticket_id,
                event_id,
                type_id,
                buyer,
            } => {
                let mint = database::Mint {
                    ticket_id: *ticket_id,
                    event_id: *event_id,
                    type_id: *type_id,
                    owner: database::address(buyer),
                };
                self.database.mint_ticket(&mint, origin).await
            }
            ContractEvent::TicketsPurchased {
                event_id,
                type_id,
                buyer,
                quantity,
                total_cost,
            } => {
                let purchase = database::Purchase {
                    event_id: *event_id,
                    type_id: *type_id,
                    buyer: database::address(buyer),
                    quantity: *quantity,
                    total_cost: database::amount(total_cost),
                };
                self.database.record_purchase(&purchase, origin).await
            }
            ContractEvent::TicketListedForResale {
                ticket_id,
                price,
                deadline,
            } => {
                let listing = database::Listing {
                    ticket_id: *ticket_id,
                    price: database::amount(price),
                    deadline: *deadline,
                };
                self.database.list_ticket(&listing, origin).await
            }
            ContractEvent::TicketResold {
                ticket_id,
                from,
                to,
                price,
            } => {
                let resale = database::Resale {
                    ticket_id: *ticket_id,
                    from: database::address(from),
                    to: database::address(to),
                    price: database::amount(price),
                };
                self.database.resell_ticket(&resale, origin).await
            }
            ContractEvent::ResaleListingCancelled { ticket_id } => {
                self.database.cancel_listing(*ticket_id, origin).await
            }
            ContractEvent::TicketUsed {
                ticket_id,
                event_id,
                user,
            } => {
                let usage = database::Usage {
                    ticket_id: *ticket_id,
                    event_id: *event_id,
                    user: database::address(user),
                };
                self.database.use_ticket(&usage, origin).await
            }
        }
    }
}
