//! GATT Actions
//!
//! One primitive step of a transaction. Actions are built once by the
//! [`TransactionBuilder`](super::transaction::TransactionBuilder) and never
//! change afterwards; the dispatcher only ever borrows them.

use crate::domain::error::QueueError;
use crate::domain::models::{ConnectionState, DeviceId};
use crate::infrastructure::bluetooth::gatt::{Characteristic, WriteType};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

/// What a platform completion event reports back.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CompletionKind {
    CharacteristicWrite,
    CharacteristicRead,
    DescriptorWrite,
    MtuChanged,
}

/// Correlation key between an in-flight action and a completion event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CompletionKey {
    pub characteristic: Option<Uuid>,
    pub kind: CompletionKind,
}

impl CompletionKey {
    pub fn new(characteristic: Option<Uuid>, kind: CompletionKind) -> Self {
        Self {
            characteristic,
            kind,
        }
    }
}

/// Read-only view handed to a [`PlainAction`] effect.
#[derive(Debug)]
pub struct ActionContext<'a> {
    pub device: &'a DeviceId,
    pub state: ConnectionState,
    pub mtu: u16,
}

type Effect = dyn Fn(&ActionContext<'_>) -> Result<(), QueueError> + Send + Sync;

/// A host-side step that runs synchronously on the dispatcher.
#[derive(Clone)]
pub struct PlainAction {
    name: String,
    effect: Arc<Effect>,
}

impl PlainAction {
    pub fn new<F>(name: impl Into<String>, effect: F) -> Self
    where
        F: Fn(&ActionContext<'_>) -> Result<(), QueueError> + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            effect: Arc::new(effect),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn run(&self, ctx: &ActionContext<'_>) -> Result<(), QueueError> {
        (self.effect)(ctx)
    }
}

impl fmt::Debug for PlainAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PlainAction")
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Clone)]
pub enum Action {
    Write {
        characteristic: Characteristic,
        value: Vec<u8>,
    },
    Read {
        characteristic: Characteristic,
    },
    /// Enable or disable notify/indicate via the CCC descriptor.
    Notify {
        characteristic: Characteristic,
        enable: bool,
    },
    Wait(Duration),
    Plain(PlainAction),
    SetState(ConnectionState),
    RequestMtu(u16),
}

impl Action {
    /// Whether the dispatcher has to suspend for a correlated completion
    /// after issuing this action.
    pub fn expects_async_result(&self) -> bool {
        match self {
            Self::Write { characteristic, .. } => {
                characteristic.write_type() == WriteType::WithResponse
            }
            Self::Read { .. } | Self::Notify { .. } | Self::RequestMtu(_) => true,
            Self::Wait(_) | Self::Plain(_) | Self::SetState(_) => false,
        }
    }

    /// The completion this action waits for, if any.
    pub fn completion_key(&self) -> Option<CompletionKey> {
        if !self.expects_async_result() {
            return None;
        }
        let key = match self {
            Self::Write { characteristic, .. } => CompletionKey::new(
                Some(characteristic.uuid),
                CompletionKind::CharacteristicWrite,
            ),
            Self::Read { characteristic } => CompletionKey::new(
                Some(characteristic.uuid),
                CompletionKind::CharacteristicRead,
            ),
            Self::Notify { characteristic, .. } => CompletionKey::new(
                Some(characteristic.uuid),
                CompletionKind::DescriptorWrite,
            ),
            Self::RequestMtu(_) => CompletionKey::new(None, CompletionKind::MtuChanged),
            Self::Wait(_) | Self::Plain(_) | Self::SetState(_) => return None,
        };
        Some(key)
    }

    pub fn characteristic(&self) -> Option<&Characteristic> {
        match self {
            Self::Write { characteristic, .. }
            | Self::Read { characteristic }
            | Self::Notify { characteristic, .. } => Some(characteristic),
            _ => None,
        }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Write {
                characteristic,
                value,
            } => write!(f, "write {} ({} bytes)", characteristic, value.len()),
            Self::Read { characteristic } => write!(f, "read {}", characteristic),
            Self::Notify {
                characteristic,
                enable,
            } => write!(f, "notify {} -> {}", characteristic, enable),
            Self::Wait(duration) => write!(f, "wait {:?}", duration),
            Self::Plain(plain) => write!(f, "plain '{}'", plain.name()),
            Self::SetState(state) => write!(f, "set state {}", state),
            Self::RequestMtu(mtu) => write!(f, "request mtu {}", mtu),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::bluetooth::gatt::{short_uuid, CharacteristicProperties};

    fn characteristic(props: CharacteristicProperties) -> Characteristic {
        Characteristic::new(short_uuid(0xfee1), props)
    }

    #[test]
    fn test_expects_async_result() {
        let write = Action::Write {
            characteristic: characteristic(CharacteristicProperties::WRITE),
            value: vec![1, 2],
        };
        let write_no_rsp = Action::Write {
            characteristic: characteristic(CharacteristicProperties::WRITE_WITHOUT_RESPONSE),
            value: vec![1, 2],
        };
        assert!(write.expects_async_result());
        assert!(!write_no_rsp.expects_async_result());
        assert!(write_no_rsp.completion_key().is_none());

        assert!(Action::RequestMtu(247).expects_async_result());
        assert!(!Action::Wait(Duration::from_millis(5)).expects_async_result());
        assert!(!Action::SetState(ConnectionState::Initialized).expects_async_result());
        assert!(!Action::Plain(PlainAction::new("noop", |_| Ok(()))).expects_async_result());
    }

    #[test]
    fn test_notify_correlates_on_descriptor_write() {
        let notify = Action::Notify {
            characteristic: characteristic(CharacteristicProperties::NOTIFY),
            enable: true,
        };
        assert_eq!(
            notify.completion_key(),
            Some(CompletionKey::new(
                Some(short_uuid(0xfee1)),
                CompletionKind::DescriptorWrite
            ))
        );
    }

    #[test]
    fn test_plain_action_runs_effect() {
        let device = DeviceId::new("AA:BB");
        let action = PlainAction::new("require initialized", |ctx| {
            if ctx.state.is_initialized() {
                Ok(())
            } else {
                Err(QueueError::Protocol("not ready".into()))
            }
        });
        let ctx = ActionContext {
            device: &device,
            state: ConnectionState::Connected,
            mtu: 23,
        };
        assert!(action.run(&ctx).is_err());
        assert_eq!(format!("{}", Action::Plain(action)), "plain 'require initialized'");
    }
}
