//! Per-connection state handed to device protocols.
//!
//! A [`ConnectionContext`] lives exactly as long as one link: it is created
//! when the platform reports the connection and flushed when it drops, so no
//! partial transfer or message survives a reconnect.

use crate::domain::error::{QueueError, ReassemblyError};
use crate::domain::models::DeviceId;
use crate::domain::settings::EngineSettings;
use crate::infrastructure::bluetooth::protocol::DeviceProtocol;
use crate::infrastructure::bluetooth::queue::Shared;
use crate::infrastructure::bluetooth::reassembly::{Fragment, MessageAssembler, MessageRouter};
use crate::infrastructure::bluetooth::transaction::{Transaction, TransactionBuilder};
use crate::infrastructure::bluetooth::transfer::TransferRegistry;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::debug;
use uuid::Uuid;

#[derive(Debug)]
pub struct ConnectionContext {
    mtu: u16,
    transfers: TransferRegistry,
    assembler: MessageAssembler,
    router: MessageRouter,
    indications: HashSet<Uuid>,
}

impl ConnectionContext {
    pub fn new(settings: &EngineSettings, protocol: &dyn DeviceProtocol) -> Self {
        let mut router = MessageRouter::new();
        protocol.register_message_handlers(&mut router);
        Self {
            mtu: settings.default_mtu,
            transfers: TransferRegistry::new(),
            assembler: MessageAssembler::new(
                settings.max_message_size,
                settings.completed_message_history,
            ),
            router,
            indications: HashSet::new(),
        }
    }

    pub fn mtu(&self) -> u16 {
        self.mtu
    }

    pub fn set_mtu(&mut self, mtu: u16) {
        self.mtu = mtu;
    }

    /// Remember whether `characteristic` was subscribed with indications so
    /// incoming values reach the right hook.
    pub fn record_subscription(&mut self, characteristic: Uuid, indication: bool) {
        if indication {
            self.indications.insert(characteristic);
        } else {
            self.indications.remove(&characteristic);
        }
    }

    pub fn is_indication(&self, characteristic: Uuid) -> bool {
        self.indications.contains(&characteristic)
    }

    pub fn transfers(&mut self) -> &mut TransferRegistry {
        &mut self.transfers
    }

    /// Drop all in-progress transfers and partial messages.
    pub fn flush(&mut self) {
        let transfers = self.transfers.flush();
        let messages = self.assembler.flush();
        self.indications.clear();
        debug!(
            "Connection context flushed ({} transfer(s), {} message(s))",
            transfers, messages
        );
    }
}

/// What a protocol hook may touch while handling one event.
pub struct ProtocolContext<'a> {
    shared: &'a Arc<Shared>,
    connection: &'a mut ConnectionContext,
}

impl<'a> ProtocolContext<'a> {
    pub(crate) fn new(shared: &'a Arc<Shared>, connection: &'a mut ConnectionContext) -> Self {
        Self { shared, connection }
    }

    pub fn device(&self) -> &DeviceId {
        self.shared.device()
    }

    pub fn mtu(&self) -> u16 {
        self.connection.mtu
    }

    pub fn max_chunk_size(&self) -> usize {
        self.shared.protocol().chunk_size_for(self.connection.mtu)
    }

    pub fn transfers(&mut self) -> &mut TransferRegistry {
        &mut self.connection.transfers
    }

    /// Builder that queues on this device. Submit it with [`submit`](Self::submit).
    pub fn transaction(&self, name: impl Into<String>) -> TransactionBuilder {
        TransactionBuilder::for_protocol(name, self.shared.protocol().clone())
    }

    /// Append a transaction behind everything already pending.
    pub fn submit(&self, transaction: Transaction) -> Result<(), QueueError> {
        self.shared.enqueue(transaction, false)
    }

    /// Run `transaction` next, ahead of the pending queue.
    pub fn submit_first(&self, transaction: Transaction) -> Result<(), QueueError> {
        self.shared.enqueue(transaction, true)
    }

    /// Feed a fragment; a completed message is dispatched to its handler
    /// right away. Returns whether a message completed.
    pub fn reassemble(&mut self, fragment: Fragment<'_>) -> Result<bool, ReassemblyError> {
        match self.connection.assembler.feed(fragment)? {
            Some(message) => {
                self.connection.router.dispatch(message);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    pub fn pending_messages(&self) -> usize {
        self.connection.assembler.pending_count()
    }
}
