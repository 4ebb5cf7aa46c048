//! Clients for systems outside the ledger

pub mod publisher;
