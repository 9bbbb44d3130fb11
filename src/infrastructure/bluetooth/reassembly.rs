//! Message Reassembly
//!
//! Vendor protocols split logical messages across several notifications.
//! [`MessageAssembler`] buffers fragments per message id until the message
//! is complete, then hands it to the [`MessageRouter`] which dispatches on
//! the message type.
//!
//! Two framings are supported:
//!
//! - length-prefixed: the first fragment announces the total length and the
//!   message completes once that many bytes arrived;
//! - terminated: the message completes on the fragment carrying the end
//!   marker.
//!
//! Fragments are positioned by byte offset, by sequence number, or simply
//! appended in arrival order.

use crate::domain::error::ReassemblyError;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::fmt;
use tracing::{debug, warn};

pub type MessageId = u32;
pub type MessageType = u16;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FragmentPosition {
    /// Byte offset inside the message; may arrive out of order.
    Offset(usize),
    /// Sequence number starting at 0; must arrive in order.
    Sequence(u32),
    /// Append to whatever has been received so far.
    Next,
}

/// One notification's worth of a message, already stripped of its vendor
/// header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fragment<'a> {
    pub message_id: MessageId,
    pub message_type: MessageType,
    pub position: FragmentPosition,
    /// Total message length, announced by the first fragment of a
    /// length-prefixed message.
    pub total_len: Option<usize>,
    pub data: &'a [u8],
    pub end: bool,
}

impl<'a> Fragment<'a> {
    pub fn new(message_id: MessageId, message_type: MessageType, data: &'a [u8]) -> Self {
        Self {
            message_id,
            message_type,
            position: FragmentPosition::Next,
            total_len: None,
            data,
            end: false,
        }
    }

    pub fn at_offset(mut self, offset: usize) -> Self {
        self.position = FragmentPosition::Offset(offset);
        self
    }

    pub fn with_sequence(mut self, sequence: u32) -> Self {
        self.position = FragmentPosition::Sequence(sequence);
        self
    }

    pub fn with_total_len(mut self, total_len: usize) -> Self {
        self.total_len = Some(total_len);
        self
    }

    pub fn last(mut self) -> Self {
        self.end = true;
        self
    }

    /// Whether this can only be the first fragment of a message. A bare end
    /// marker or a continuation never is.
    fn opens_message(&self) -> bool {
        if self.total_len.is_some() {
            return true;
        }
        !self.end
            && matches!(
                self.position,
                FragmentPosition::Sequence(0) | FragmentPosition::Offset(0)
            )
    }
}

/// A fully reassembled message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub id: MessageId,
    pub message_type: MessageType,
    pub payload: Vec<u8>,
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "message {} (type {:#06x}, {} bytes)",
            self.id,
            self.message_type,
            self.payload.len()
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Framing {
    LengthPrefixed(usize),
    Terminated,
}

#[derive(Debug)]
struct PendingMessage {
    message_type: MessageType,
    framing: Framing,
    buffer: Vec<u8>,
    /// Offset-positioned fragments that arrived ahead of the gap.
    ahead: BTreeMap<usize, Vec<u8>>,
    next_sequence: u32,
    end_seen: bool,
}

impl PendingMessage {
    fn new(message_type: MessageType, total_len: Option<usize>) -> Self {
        Self {
            message_type,
            framing: total_len.map_or(Framing::Terminated, Framing::LengthPrefixed),
            buffer: Vec::new(),
            ahead: BTreeMap::new(),
            next_sequence: 0,
            end_seen: false,
        }
    }

    fn buffered(&self) -> usize {
        self.buffer.len() + self.ahead.values().map(Vec::len).sum::<usize>()
    }

    fn place_at(&mut self, offset: usize, data: &[u8]) {
        let filled = self.buffer.len();
        if offset > filled {
            self.ahead.insert(offset, data.to_vec());
            return;
        }
        let end = offset + data.len();
        if end <= filled {
            debug!("Ignoring already received bytes {}..{}", offset, end);
            return;
        }
        self.buffer.extend_from_slice(&data[filled - offset..]);
        self.drain_ahead();
    }

    fn drain_ahead(&mut self) {
        while let Some((&offset, _)) = self.ahead.first_key_value() {
            let filled = self.buffer.len();
            if offset > filled {
                break;
            }
            if let Some(data) = self.ahead.remove(&offset) {
                if offset + data.len() > filled {
                    self.buffer.extend_from_slice(&data[filled - offset..]);
                }
            }
        }
    }
}

enum Step {
    Pending,
    Complete,
    Failed(ReassemblyError),
}

/// Per-connection buffer of partially received messages.
#[derive(Debug)]
pub struct MessageAssembler {
    pending: HashMap<MessageId, PendingMessage>,
    completed: VecDeque<MessageId>,
    history: usize,
    max_message_size: usize,
}

impl MessageAssembler {
    pub fn new(max_message_size: usize, history: usize) -> Self {
        Self {
            pending: HashMap::new(),
            completed: VecDeque::with_capacity(history),
            history,
            max_message_size,
        }
    }

    /// Feed one fragment. Returns the message once it is complete; the
    /// pending entry is gone at that point. On error the partial message is
    /// discarded and the assembler remains usable.
    pub fn feed(&mut self, fragment: Fragment<'_>) -> Result<Option<Message>, ReassemblyError> {
        let id = fragment.message_id;

        if !self.pending.contains_key(&id) && self.completed.contains(&id) {
            if !fragment.opens_message() {
                debug!("Repeated fragment for completed message {}", id);
                return Ok(None);
            }
            // Id reused for a new message.
            self.completed.retain(|done| *done != id);
        }

        let limit = self.max_message_size;
        let entry = self
            .pending
            .entry(id)
            .or_insert_with(|| PendingMessage::new(fragment.message_type, fragment.total_len));

        // The header carrying the length may arrive after later bytes.
        if let Some(announced) = fragment.total_len {
            let framing = entry.framing;
            match framing {
                Framing::Terminated => entry.framing = Framing::LengthPrefixed(announced),
                Framing::LengthPrefixed(expected) if expected != announced => {
                    let err = ReassemblyError::LengthMismatch {
                        id,
                        expected,
                        announced,
                    };
                    warn!("Dropping partial message {}: {}", id, err);
                    self.pending.remove(&id);
                    return Err(err);
                }
                Framing::LengthPrefixed(_) => {}
            }
        }

        let step = Self::apply(entry, id, &fragment, limit);
        match step {
            Step::Pending => Ok(None),
            Step::Failed(err) => {
                warn!("Dropping partial message {}: {}", id, err);
                self.pending.remove(&id);
                Err(err)
            }
            Step::Complete => {
                let Some(done) = self.pending.remove(&id) else {
                    return Ok(None);
                };
                self.remember(id);
                let message = Message {
                    id,
                    message_type: done.message_type,
                    payload: done.buffer,
                };
                debug!("Reassembled {}", message);
                Ok(Some(message))
            }
        }
    }

    fn apply(entry: &mut PendingMessage, id: MessageId, fragment: &Fragment<'_>, limit: usize) -> Step {
        match fragment.position {
            FragmentPosition::Next => entry.buffer.extend_from_slice(fragment.data),
            FragmentPosition::Sequence(got) => {
                if got != entry.next_sequence {
                    return Step::Failed(ReassemblyError::OutOfOrder {
                        id,
                        expected: entry.next_sequence,
                        got,
                    });
                }
                entry.next_sequence += 1;
                entry.buffer.extend_from_slice(fragment.data);
            }
            FragmentPosition::Offset(offset) => entry.place_at(offset, fragment.data),
        }

        let size = entry.buffered();
        if size > limit {
            return Step::Failed(ReassemblyError::TooLarge { id, size, limit });
        }
        if fragment.end {
            entry.end_seen = true;
        }

        match entry.framing {
            Framing::LengthPrefixed(expected) => {
                let received = entry.buffer.len();
                if received > expected {
                    Step::Failed(ReassemblyError::Overflow {
                        id,
                        expected,
                        received,
                    })
                } else if received == expected && entry.ahead.is_empty() {
                    Step::Complete
                } else if entry.end_seen {
                    Step::Failed(ReassemblyError::Truncated {
                        id,
                        expected,
                        received,
                    })
                } else {
                    Step::Pending
                }
            }
            Framing::Terminated if entry.end_seen && entry.ahead.is_empty() => Step::Complete,
            Framing::Terminated => Step::Pending,
        }
    }

    fn remember(&mut self, id: MessageId) {
        if self.history == 0 {
            return;
        }
        if self.completed.len() == self.history {
            self.completed.pop_front();
        }
        self.completed.push_back(id);
    }

    pub fn is_pending(&self, id: MessageId) -> bool {
        self.pending.contains_key(&id)
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// Discard every partial message. Returns how many were dropped.
    pub fn flush(&mut self) -> usize {
        let count = self.pending.len();
        if count > 0 {
            warn!("Discarding {} partially received message(s)", count);
        }
        self.pending.clear();
        self.completed.clear();
        count
    }
}

pub type MessageHandler = Box<dyn FnMut(Message) -> anyhow::Result<()> + Send>;

/// Dispatches complete messages to handlers by message type.
#[derive(Default)]
pub struct MessageRouter {
    handlers: HashMap<MessageType, MessageHandler>,
}

impl MessageRouter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the handler for `message_type`, replacing any previous one.
    pub fn register<F>(&mut self, message_type: MessageType, handler: F)
    where
        F: FnMut(Message) -> anyhow::Result<()> + Send + 'static,
    {
        if self
            .handlers
            .insert(message_type, Box::new(handler))
            .is_some()
        {
            debug!("Replaced handler for message type {:#06x}", message_type);
        }
    }

    pub fn handles(&self, message_type: MessageType) -> bool {
        self.handlers.contains_key(&message_type)
    }

    /// Returns whether a handler accepted the message. Unknown types are
    /// dropped with a warning.
    pub fn dispatch(&mut self, message: Message) -> bool {
        let Some(handler) = self.handlers.get_mut(&message.message_type) else {
            warn!("No handler for {}, dropping", message);
            return false;
        };
        let id = message.id;
        match handler(message) {
            Ok(()) => true,
            Err(e) => {
                warn!("Handler for message {} failed: {:#}", id, e);
                false
            }
        }
    }
}

impl fmt::Debug for MessageRouter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut types: Vec<_> = self.handlers.keys().collect();
        types.sort();
        f.debug_struct("MessageRouter")
            .field("message_types", &types)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    fn assembler() -> MessageAssembler {
        MessageAssembler::new(1024, 4)
    }

    #[test]
    fn test_offset_fragments_assemble_once() {
        let data: Vec<u8> = (0u8..120).collect();
        let mut asm = assembler();

        assert_eq!(asm.feed(Fragment::new(9, 1, &data[0..50]).at_offset(0)), Ok(None));
        assert_eq!(asm.feed(Fragment::new(9, 1, &data[50..100]).at_offset(50)), Ok(None));
        let message = asm
            .feed(Fragment::new(9, 1, &data[100..120]).at_offset(100).last())
            .unwrap()
            .expect("message complete");
        assert_eq!(message.payload, data);
        assert_eq!(message.message_type, 1);
        assert!(!asm.is_pending(9));

        // Retransmitted end marker after completion.
        assert_eq!(
            asm.feed(Fragment::new(9, 1, &data[100..120]).at_offset(100).last()),
            Ok(None)
        );
        assert_eq!(asm.pending_count(), 0);
    }

    #[test]
    fn test_offset_fragments_out_of_order() {
        let data: Vec<u8> = (0u8..30).collect();
        let mut asm = assembler();

        assert_eq!(
            asm.feed(Fragment::new(1, 2, &data[20..30]).at_offset(20).last()),
            Ok(None)
        );
        assert_eq!(asm.feed(Fragment::new(1, 2, &data[10..20]).at_offset(10)), Ok(None));
        let message = asm
            .feed(Fragment::new(1, 2, &data[0..10]).at_offset(0))
            .unwrap()
            .unwrap();
        assert_eq!(message.payload, data);
    }

    #[test]
    fn test_sequence_gap_discards_message() {
        let mut asm = assembler();
        asm.feed(Fragment::new(3, 1, b"ab").with_sequence(0)).unwrap();
        let err = asm
            .feed(Fragment::new(3, 1, b"cd").with_sequence(2))
            .unwrap_err();
        assert_eq!(
            err,
            ReassemblyError::OutOfOrder {
                id: 3,
                expected: 1,
                got: 2
            }
        );
        assert!(!asm.is_pending(3));
    }

    #[test]
    fn test_length_prefixed_framing() {
        let mut asm = assembler();
        assert_eq!(asm.feed(Fragment::new(4, 7, b"hel").with_total_len(5)), Ok(None));
        let message = asm.feed(Fragment::new(4, 7, b"lo")).unwrap().unwrap();
        assert_eq!(message.payload, b"hello");

        asm.feed(Fragment::new(5, 7, b"abc").with_total_len(4)).unwrap();
        assert!(matches!(
            asm.feed(Fragment::new(5, 7, b"de")),
            Err(ReassemblyError::Overflow {
                expected: 4,
                received: 5,
                ..
            })
        ));

        asm.feed(Fragment::new(6, 7, b"ab").with_total_len(4)).unwrap();
        assert!(matches!(
            asm.feed(Fragment::new(6, 7, b"c").last()),
            Err(ReassemblyError::Truncated { received: 3, .. })
        ));
        assert_eq!(asm.pending_count(), 0);
    }

    #[test]
    fn test_repeated_tail_of_length_prefixed_message_is_ignored() {
        let mut asm = assembler();
        asm.feed(Fragment::new(4, 7, b"hel").with_total_len(5)).unwrap();
        assert_eq!(asm.feed(Fragment::new(4, 7, b"lo")).unwrap().unwrap().payload, b"hello");

        assert_eq!(asm.feed(Fragment::new(4, 7, b"lo")), Ok(None));
        assert_eq!(asm.pending_count(), 0);

        let next = asm.feed(Fragment::new(4, 7, b"abcde").with_total_len(5));
        assert_eq!(next.unwrap().unwrap().payload, b"abcde");
        assert_eq!(asm.pending_count(), 0);
    }

    #[test]
    fn test_length_header_after_later_bytes() {
        let data: Vec<u8> = (0u8..100).collect();
        let mut asm = assembler();
        assert_eq!(asm.feed(Fragment::new(1, 2, &data[50..]).at_offset(50)), Ok(None));
        let message = asm
            .feed(Fragment::new(1, 2, &data[..50]).at_offset(0).with_total_len(100))
            .unwrap()
            .unwrap();
        assert_eq!(message.payload, data);
        assert_eq!(asm.pending_count(), 0);
    }

    #[test]
    fn test_conflicting_length_drops_message() {
        let mut asm = assembler();
        asm.feed(Fragment::new(2, 2, b"ab").with_total_len(6)).unwrap();
        assert_eq!(
            asm.feed(Fragment::new(2, 2, b"cd").with_total_len(8)),
            Err(ReassemblyError::LengthMismatch {
                id: 2,
                expected: 6,
                announced: 8
            })
        );
        assert!(!asm.is_pending(2));
    }

    #[test]
    fn test_size_limit() {
        let mut asm = MessageAssembler::new(8, 4);
        asm.feed(Fragment::new(1, 1, &[0u8; 6])).unwrap();
        assert!(matches!(
            asm.feed(Fragment::new(1, 1, &[0u8; 6])),
            Err(ReassemblyError::TooLarge { size: 12, limit: 8, .. })
        ));
    }

    #[test]
    fn test_reused_id_starts_new_message() {
        let mut asm = assembler();
        asm.feed(Fragment::new(1, 1, b"one").last()).unwrap().unwrap();
        assert_eq!(asm.feed(Fragment::new(1, 1, b"tw").at_offset(0)), Ok(None));
        let second = asm.feed(Fragment::new(1, 1, b"o").last()).unwrap().unwrap();
        assert_eq!(second.payload, b"two");
    }

    #[test]
    fn test_flush() {
        let mut asm = assembler();
        asm.feed(Fragment::new(1, 1, b"a")).unwrap();
        asm.feed(Fragment::new(2, 1, b"b")).unwrap();
        assert_eq!(asm.flush(), 2);
        assert_eq!(asm.pending_count(), 0);
    }

    #[test]
    fn test_router_dispatch() {
        let received = Arc::new(Mutex::new(Vec::new()));
        let sink = received.clone();
        let mut router = MessageRouter::new();
        router.register(0x10, move |message| {
            sink.lock().unwrap().push(message.payload);
            Ok(())
        });
        router.register(0x11, |_| anyhow::bail!("malformed"));

        let message = |message_type| Message {
            id: 1,
            message_type,
            payload: vec![1, 2, 3],
        };
        assert!(router.dispatch(message(0x10)));
        assert!(!router.dispatch(message(0x11)));
        assert!(!router.dispatch(message(0x12)));
        assert_eq!(received.lock().unwrap().as_slice(), &[vec![1, 2, 3]]);
        assert!(router.handles(0x10));
    }
}
