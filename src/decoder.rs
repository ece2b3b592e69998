//! Module implementing event decoding logic. This module is responsible for
//! taking a raw contract log and decoding it into a typed [`ContractEvent`].

use crate::chain::RawLog;
use anyhow::{Context, Result};
use solabi::{
    abi::EventDescriptor,
    ethprim::{Address, Digest, U256},
    value::{EventEncoder, Value},
};
use std::{borrow::Cow, fmt};
use thiserror::Error;

/// The contract events the indexer mirrors, in catch-up scan order. Parents
/// come before the events that depend on them.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, PartialOrd, Ord)]
pub enum Signature {
    EventCreated,
    EventApproved,
    EventRejected,
    TicketTypeAdded,
    TicketTypeUpdated,
    TicketMinted,
    TicketsPurchased,
    TicketListedForResale,
    TicketResold,
    ResaleListingCancelled,
    TicketUsed,
}

impl Signature {
    pub const ALL: [Signature; 11] = [
        Signature::EventCreated,
        Signature::EventApproved,
        Signature::EventRejected,
        Signature::TicketTypeAdded,
        Signature::TicketTypeUpdated,
        Signature::TicketMinted,
        Signature::TicketsPurchased,
        Signature::TicketListedForResale,
        Signature::TicketResold,
        Signature::ResaleListingCancelled,
        Signature::TicketUsed,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Signature::EventCreated => "EventCreated",
            Signature::EventApproved => "EventApproved",
            Signature::EventRejected => "EventRejected",
            Signature::TicketTypeAdded => "TicketTypeAdded",
            Signature::TicketTypeUpdated => "TicketTypeUpdated",
            Signature::TicketMinted => "TicketMinted",
            Signature::TicketsPurchased => "TicketsPurchased",
            Signature::TicketListedForResale => "TicketListedForResale",
            Signature::TicketResold => "TicketResold",
            Signature::ResaleListingCancelled => "ResaleListingCancelled",
            Signature::TicketUsed => "TicketUsed",
        }
    }

    /// The Solidity declaration of the event as emitted by the contract.
    pub fn declaration(self) -> &'static str {
        match self {
            Signature::EventCreated => {
                "event EventCreated(uint256 indexed eventId, address indexed creator, string eventName)"
            }
            Signature::EventApproved => {
                "event EventApproved(uint256 indexed eventId, address indexed creator)"
            }
            Signature::EventRejected => {
                "event EventRejected(uint256 indexed eventId, address indexed creator)"
            }
            Signature::TicketTypeAdded => {
                "event TicketTypeAdded(uint256 indexed eventId, uint256 indexed typeId, string typeName, uint256 price, uint256 supply)"
            }
            Signature::TicketTypeUpdated => {
                "event TicketTypeUpdated(uint256 indexed eventId, uint256 indexed typeId, uint256 price, uint256 supply)"
            }
            Signature::TicketMinted => {
                "event TicketMinted(uint256 indexed ticketId, uint256 indexed eventId, uint256 indexed typeId, address buyer)"
            }
            Signature::TicketsPurchased => {
                "event TicketsPurchased(uint256 indexed eventId, uint256 indexed typeId, address indexed buyer, uint256 quantity, uint256 totalCost)"
            }
            Signature::TicketListedForResale => {
                "event TicketListedForResale(uint256 indexed ticketId, uint256 resalePrice, uint256 deadline)"
            }
            Signature::TicketResold => {
                "event TicketResold(uint256 indexed ticketId, address indexed from, address indexed to, uint256 price)"
            }
            Signature::ResaleListingCancelled => {
                "event ResaleListingCancelled(uint256 indexed ticketId)"
            }
            Signature::TicketUsed => {
                "event TicketUsed(uint256 indexed ticketId, uint256 indexed eventId, address indexed user)"
            }
        }
    }
}

impl fmt::Display for Signature {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum ContractEvent {
    EventCreated {
        event_id: u64,
        creator: Address,
        name: String,
    },
    EventApproved {
        event_id: u64,
        creator: Address,
    },
    EventRejected {
        event_id: u64,
        creator: Address,
    },
    TicketTypeAdded {
        event_id: u64,
        type_id: u64,
        name: String,
        price: U256,
        supply: u64,
    },
    TicketTypeUpdated {
        event_id: u64,
        type_id: u64,
        price: U256,
        supply: u64,
    },
    TicketMinted {
        ticket_id: u64,
        event_id: u64,
        type_id: u64,
        buyer: Address,
    },
    TicketsPurchased {
        event_id: u64,
        type_id: u64,
        buyer: Address,
        quantity: u64,
        total_cost: U256,
    },
    TicketListedForResale {
        ticket_id: u64,
        price: U256,
        deadline: u64,
    },
    TicketResold {
        ticket_id: u64,
        from: Address,
        to: Address,
        price: U256,
    },
    ResaleListingCancelled {
        ticket_id: u64,
    },
    TicketUsed {
        ticket_id: u64,
        event_id: u64,
        user: Address,
    },
}

impl ContractEvent {
    pub fn signature(&self) -> Signature {
        match self {
            ContractEvent::EventCreated { .. } => Signature::EventCreated,
            ContractEvent::EventApproved { .. } => Signature::EventApproved,
            ContractEvent::EventRejected { .. } => Signature::EventRejected,
            ContractEvent::TicketTypeAdded { .. } => Signature::TicketTypeAdded,
            ContractEvent::TicketTypeUpdated { .. } => Signature::TicketTypeUpdated,
            ContractEvent::TicketMinted { .. } => Signature::TicketMinted,
            ContractEvent::TicketsPurchased { .. } => Signature::TicketsPurchased,
            ContractEvent::TicketListedForResale { .. } => Signature::TicketListedForResale,
            ContractEvent::TicketResold { .. } => Signature::TicketResold,
            ContractEvent::ResaleListingCancelled { .. } => Signature::ResaleListingCancelled,
            ContractEvent::TicketUsed { .. } => Signature::TicketUsed,
        }
    }
}

#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("log has no topics or an unknown first topic")]
    UnknownTopic,

    #[error("ABI decoding failed: {0}")]
    Abi(String),

    #[error("field {index} of {signature} has an unexpected type")]
    Shape { signature: Signature, index: usize },

    #[error("field {index} of {signature} does not fit into 64 bits")]
    OutOfRange { signature: Signature, index: usize },
}

struct Entry {
    signature: Signature,
    topic: Digest,
    encoder: EventEncoder,
}

/// Decoder for all contract events the indexer understands.
pub struct Decoder {
    entries: Vec<Entry>,
}

impl Decoder {
    pub fn new() -> Result<Self> {
        let entries = Signature::ALL
            .iter()
            .map(|&signature| {
                let descriptor = EventDescriptor::parse_declaration(signature.declaration())
                    .with_context(|| format!("invalid declaration for {signature}"))?;
                anyhow::ensure!(!descriptor.anonymous, "anonymous events are not supported");
                let topic = Digest(
                    descriptor
                        .selector()
                        .context("anonymous events are not supported")?,
                );
                let encoder = EventEncoder::new(&descriptor)?;
                Ok(Entry {
                    signature,
                    topic,
                    encoder,
                })
            })
            .collect::<Result<_>>()?;

        Ok(Self { entries })
    }

    /// Returns the first log topic identifying the specified event.
    pub fn topic(&self, signature: Signature) -> Digest {
        self.entry(signature).topic
    }

    /// Identifies a raw log by its first topic.
    pub fn identify(&self, log: &RawLog) -> Option<Signature> {
        let topic = log.topics.first()?;
        self.entries
            .iter()
            .find(|entry| entry.topic == *topic)
            .map(|entry| entry.signature)
    }

    /// Decodes a raw log into a typed contract event.
    pub fn decode(&self, log: &RawLog) -> Result<ContractEvent, DecodeError> {
        let signature = self.identify(log).ok_or(DecodeError::UnknownTopic)?;
        let fields = self
            .entry(signature)
            .encoder
            .decode(&solabi::log::Log {
                topics: {
                    let mut converted = solabi::log::Topics::default();
                    for topic in &log.topics {
                        converted.push(topic);
                    }
                    converted
                },
                data: Cow::Borrowed(&log.data),
            })
            .map_err(|err| DecodeError::Abi(err.to_string()))?;

        let fields = Fields { signature, fields };
        let event = match signature {
            Signature::EventCreated => ContractEvent::EventCreated {
                event_id: fields.id(0)?,
                creator: fields.address(1)?,
                name: fields.string(2)?,
            },
            Signature::EventApproved => ContractEvent::EventApproved {
                event_id: fields.id(0)?,
                creator: fields.address(1)?,
            },
            Signature::EventRejected => ContractEvent::EventRejected {
                event_id: fields.id(0)?,
                creator: fields.address(1)?,
            },
            Signature::TicketTypeAdded => ContractEvent::TicketTypeAdded {
                event_id: fields.id(0)?,
                type_id: fields.id(1)?,
                name: fields.string(2)?,
                price: fields.uint(3)?,
                supply: fields.id(4)?,
            },
            Signature::TicketTypeUpdated => ContractEvent::TicketTypeUpdated {
                event_id: fields.id(0)?,
                type_id: fields.id(1)?,
                price: fields.uint(2)?,
                supply: fields.id(3)?,
            },
            Signature::TicketMinted => ContractEvent::TicketMinted {
                ticket_id: fields.id(0)?,
                event_id: fields.id(1)?,
                type_id: fields.id(2)?,
                buyer: fields.address(3)?,
            },
            Signature::TicketsPurchased => ContractEvent::TicketsPurchased {
                event_id: fields.id(0)?,
                type_id: fields.id(1)?,
                buyer: fields.address(2)?,
                quantity: fields.id(3)?,
                total_cost: fields.uint(4)?,
            },
            Signature::TicketListedForResale => ContractEvent::TicketListedForResale {
                ticket_id: fields.id(0)?,
                price: fields.uint(1)?,
                deadline: fields.id(2)?,
            },
            Signature::TicketResold => ContractEvent::TicketResold {
                ticket_id: fields.id(0)?,
                from: fields.address(1)?,
                to: fields.address(2)?,
                price: fields.uint(3)?,
            },
            Signature::ResaleListingCancelled => ContractEvent::ResaleListingCancelled {
                ticket_id: fields.id(0)?,
            },
            Signature::TicketUsed => ContractEvent::TicketUsed {
                ticket_id: fields.id(0)?,
                event_id: fields.id(1)?,
                user: fields.address(2)?,
            },
        };
        Ok(event)
    }

    fn entry(&self, signature: Signature) -> &Entry {
        // `entries` is built from `Signature::ALL` in declaration order.
        &self.entries[signature as usize]
    }
}

/// Positional access to decoded event fields.
struct Fields {
    signature: Signature,
    fields: Vec<Value>,
}

impl Fields {
    fn shape(&self, index: usize) -> DecodeError {
        DecodeError::Shape {
            signature: self.signature,
            index,
        }
    }

    fn uint(&self, index: usize) -> Result<U256, DecodeError> {
        match self.fields.get(index) {
            Some(Value::Uint(value)) => Ok(value.get()),
            _ => Err(self.shape(index)),
        }
    }

    fn id(&self, index: usize) -> Result<u64, DecodeError> {
        let value = self.uint(index)?;
        u64::try_from(value).map_err(|_| DecodeError::OutOfRange {
            signature: self.signature,
            index,
        })
    }

    fn address(&self, index: usize) -> Result<Address, DecodeError> {
        match self.fields.get(index) {
            Some(Value::Address(value)) => Ok(*value),
            _ => Err(self.shape(index)),
        }
    }

    fn string(&self, index: usize) -> Result<String, DecodeError> {
        match self.fields.get(index) {
            Some(Value::String(value)) => Ok(value.clone()),
            _ => Err(self.shape(index)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::logs;
    use hex_literal::hex;

    #[test]
    fn topics_are_distinct() {
        let decoder = Decoder::new().unwrap();
        let mut topics = Signature::ALL
            .iter()
            .map(|&signature| decoder.topic(signature))
            .collect::<Vec<_>>();
        topics.sort_by_key(|topic| topic.0);
        topics.dedup();
        assert_eq!(topics.len(), Signature::ALL.len());
    }

    #[test]
    fn decode_ticket_minted() {
        let decoder = Decoder::new().unwrap();
        let log = logs::ticket_minted(&decoder, 42, 7, 1, Address([0xbb; 20]));

        assert_eq!(decoder.identify(&log), Some(Signature::TicketMinted));
        assert_eq!(
            decoder.decode(&log).unwrap(),
            ContractEvent::TicketMinted {
                ticket_id: 42,
                event_id: 7,
                type_id: 1,
                buyer: Address([0xbb; 20]),
            }
        );
    }

    #[test]
    fn decode_listing_with_data_words() {
        let decoder = Decoder::new().unwrap();
        let log = RawLog {
            topics: vec![
                decoder.topic(Signature::TicketListedForResale),
                Digest(hex!(
                    "0000000000000000000000000000000000000000000000000000000000000005"
                )),
            ],
            data: hex!(
                "00000000000000000000000000000000000000000000000000000000000003e8"
                "0000000000000000000000000000000000000000000000000000000065000000"
            )
            .to_vec(),
            ..Default::default()
        };

        assert_eq!(
            decoder.decode(&log).unwrap(),
            ContractEvent::TicketListedForResale {
                ticket_id: 5,
                price: U256::from(1000_u64),
                deadline: 0x65000000,
            }
        );
    }

    #[test]
    fn unknown_topic() {
        let decoder = Decoder::new().unwrap();
        let log = RawLog {
            topics: vec![Digest([0xee; 32])],
            ..Default::default()
        };
        assert!(decoder.identify(&log).is_none());
        assert!(matches!(decoder.decode(&log), Err(DecodeError::UnknownTopic)));
    }

    #[test]
    fn ids_must_fit_in_64_bits() {
        let decoder = Decoder::new().unwrap();
        let log = RawLog {
            topics: vec![
                decoder.topic(Signature::ResaleListingCancelled),
                Digest(hex!(
                    "0000000000000000000000000000000100000000000000000000000000000000"
                )),
            ],
            ..Default::default()
        };
        assert!(matches!(
            decoder.decode(&log),
            Err(DecodeError::OutOfRange { index: 0, .. })
        ));
    }
}
