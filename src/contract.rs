//! Read-only contract calls used to enrich logs with state that the events
//! themselves do not carry.

use crate::chain::ChainClient;
use anyhow::{Context, Result};
use futures::{future::BoxFuture, FutureExt};
use solabi::{
    abi::FunctionDescriptor,
    ethprim::{Address, U256},
    value::{FunctionEncoder, Uint, Value},
};
use std::sync::Arc;

/// Event details as returned by `getEventDetails`.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct EventDetails {
    pub event_uri: String,
    pub document_uri: String,
    pub event_date: u64,
    pub event_active: bool,
    pub created_at: u64,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ShareDetails {
    pub beneficiary: Address,
    pub percentage: u64,
}

/// The parts of `getTicketType` that the `TicketType*` events do not carry.
/// The contract's `sold` count is not read: the mirrored counter is derived
/// from mint and purchase events only.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct TicketTypeDetails {
    pub sale_start: u64,
    pub sale_end: u64,
    pub active: bool,
}

pub trait ContractReader: Send + Sync {
    fn event_details(&self, event_id: u64) -> BoxFuture<'_, Result<EventDetails>>;

    fn revenue_shares(&self, event_id: u64) -> BoxFuture<'_, Result<Vec<ShareDetails>>>;

    fn ticket_type(
        &self,
        event_id: u64,
        type_id: u64,
    ) -> BoxFuture<'_, Result<TicketTypeDetails>>;
}

const GET_EVENT_DETAILS: &str = "function getEventDetails(uint256 eventId) view returns ((uint256 eventId, address eventCreator, string eventName, string eventURI, string documentURI, uint256 eventDate, bool eventActive, uint8 status, uint256 createdAt, uint256 approvedAt))";
const GET_REVENUE_SHARES: &str = "function getRevenueShares(uint256 eventId) view returns ((address beneficiary, uint256 percentage)[])";
const GET_TICKET_TYPE: &str = "function getTicketType(uint256 eventId, uint256 typeId) view returns ((uint256 typeId, string typeName, uint256 price, uint256 totalSupply, uint256 sold, uint256 saleStartTime, uint256 saleEndTime, bool active))";

/// [`ContractReader`] implemented with `eth_call`s through a chain client.
pub struct Contract {
    chain: Arc<dyn ChainClient>,
    get_event_details: FunctionEncoder,
    get_revenue_shares: FunctionEncoder,
    get_ticket_type: FunctionEncoder,
}

impl Contract {
    pub fn new(chain: Arc<dyn ChainClient>) -> Result<Self> {
        let encoder = |declaration: &str| -> Result<FunctionEncoder> {
            let descriptor = FunctionDescriptor::parse_declaration(declaration)
                .with_context(|| format!("invalid function declaration {declaration:?}"))?;
            Ok(FunctionEncoder::new(&descriptor))
        };
        Ok(Self {
            chain,
            get_event_details: encoder(GET_EVENT_DETAILS)?,
            get_revenue_shares: encoder(GET_REVENUE_SHARES)?,
            get_ticket_type: encoder(GET_TICKET_TYPE)?,
        })
    }

    async fn call(&self, function: &FunctionEncoder, params: &[u64]) -> Result<Vec<Value>> {
        let params = params
            .iter()
            .map(|&param| {
                Ok(Value::Uint(
                    Uint::new(256, U256::from(param)).context("invalid uint256")?,
                ))
            })
            .collect::<Result<Vec<_>>>()?;
        let input = function.encode_params(&params)?;
        let output = self.chain.call(input).await?;
        Ok(function.decode_returns(&output)?)
    }
}

impl ContractReader for Contract {
    fn event_details(&self, event_id: u64) -> BoxFuture<'_, Result<EventDetails>> {
        async move {
            let returns = self.call(&self.get_event_details, &[event_id]).await?;
            let details = tuple(returns.first(), "getEventDetails")?;
            Ok(EventDetails {
                event_uri: string(details.get(3))?,
                document_uri: string(details.get(4))?,
                event_date: uint(details.get(5))?,
                event_active: boolean(details.get(6))?,
                created_at: uint(details.get(8))?,
            })
        }
        .boxed()
    }

    fn revenue_shares(&self, event_id: u64) -> BoxFuture<'_, Result<Vec<ShareDetails>>> {
        async move {
            let returns = self.call(&self.get_revenue_shares, &[event_id]).await?;
            let shares = match returns.first() {
                Some(Value::Array(shares)) => shares,
                _ => anyhow::bail!("unexpected getRevenueShares return data"),
            };
            shares
                .as_slice()
                .iter()
                .map(|share| {
                    let share = tuple(Some(share), "revenue share")?;
                    Ok(ShareDetails {
                        beneficiary: address(share.first())?,
                        percentage: uint(share.get(1))?,
                    })
                })
                .collect()
        }
        .boxed()
    }

    fn ticket_type(
        &self,
        event_id: u64,
        type_id: u64,
    ) -> BoxFuture<'_, Result<TicketTypeDetails>> {
        async move {
            let returns = self
                .call(&self.get_ticket_type, &[event_id, type_id])
                .await?;
            let ticket_type = tuple(returns.first(), "getTicketType")?;
            Ok(TicketTypeDetails {
                sale_start: uint(ticket_type.get(5))?,
                sale_end: uint(ticket_type.get(6))?,
                active: boolean(ticket_type.get(7))?,
            })
        }
        .boxed()
    }
}

fn tuple<'a>(value: Option<&'a Value>, what: &str) -> Result<&'a [Value]> {
    match value {
        Some(Value::Tuple(fields)) => Ok(fields),
        _ => anyhow::bail!("unexpected {what} return data"),
    }
}

fn uint(value: Option<&Value>) -> Result<u64> {
    match value {
        Some(Value::Uint(value)) => u64::try_from(value.get()).context("integer out of range"),
        _ => anyhow::bail!("expected uint field"),
    }
}

fn boolean(value: Option<&Value>) -> Result<bool> {
    match value {
        Some(Value::Bool(value)) => Ok(*value),
        _ => anyhow::bail!("expected bool field"),
    }
}

fn string(value: Option<&Value>) -> Result<String> {
    match value {
        Some(Value::String(value)) => Ok(value.clone()),
        _ => anyhow::bail!("expected string field"),
    }
}

fn address(value: Option<&Value>) -> Result<Address> {
    match value {
        Some(Value::Address(value)) => Ok(*value),
        _ => anyhow::bail!("expected address field"),
    }
}
