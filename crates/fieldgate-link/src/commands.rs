//! Command messages and the priority queue.
//!
//! Inbound messages are self-describing JSON: an operation, a target entity
//! type, optional identifiers and a configuration payload. Commands are
//! ordered by (priority, arrival) in a min-heap; a dedicated worker pops
//! and dispatches them sequentially.

use std::collections::BinaryHeap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Operation carried by a command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Op {
    Read,
    Create,
    Update,
    Delete,
    Batch,
}

/// Batch execution modes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BatchMode {
    #[default]
    Sequential,
    Parallel,
    Atomic,
}

/// Command priorities; lower value runs first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default, Serialize, Deserialize)]
pub enum CommandPriority {
    High = 0,
    #[default]
    Normal = 1,
    Low = 2,
}

impl CommandPriority {
    pub fn from_value(value: u8) -> Self {
        match value {
            0 => CommandPriority::High,
            2 => CommandPriority::Low,
            _ => CommandPriority::Normal,
        }
    }
}

/// One parsed command message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandMessage {
    pub op: Op,
    /// Target entity type, e.g. "device", "register", "full_config".
    #[serde(rename = "type", default)]
    pub entity: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub register_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub priority: Option<u8>,
    /// `devices_with_registers` payload shaping.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub minimal: Option<bool>,
    /// `device_control` action: "enable" or "disable".
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub action: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason_detail: Option<String>,
    /// Batch mode.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mode: Option<BatchMode>,
    /// Batch sub-commands.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub commands: Option<Vec<CommandMessage>>,
}

impl CommandMessage {
    pub fn parse(bytes: &[u8]) -> Result<Self, String> {
        serde_json::from_slice(bytes).map_err(|e| e.to_string())
    }

    pub fn priority(&self) -> CommandPriority {
        self.priority
            .map(CommandPriority::from_value)
            .unwrap_or_default()
    }
}

/// Membership of a fanned-out batch element.
///
/// A parallel batch never executes as one unit: each sub-command enters
/// the queue as its own entry carrying this tag, and the dispatcher
/// aggregates completions by `batch_id` before answering the client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchTag {
    pub batch_id: u64,
    /// Position of this element in the original batch.
    pub index: usize,
}

/// A command with its queue bookkeeping.
#[derive(Debug, Clone)]
pub struct PendingCommand {
    /// Unique 64-bit command id.
    pub id: u64,
    pub priority: CommandPriority,
    pub message: CommandMessage,
    /// Present when this entry is one element of a parallel batch.
    pub batch: Option<BatchTag>,
}

#[derive(Debug)]
struct QueueItem {
    command: PendingCommand,
    /// FIFO tiebreak within a priority.
    sequence: u64,
}

impl PartialEq for QueueItem {
    fn eq(&self, other: &Self) -> bool {
        self.command.priority == other.command.priority && self.sequence == other.sequence
    }
}

impl Eq for QueueItem {}

impl PartialOrd for QueueItem {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for QueueItem {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        // BinaryHeap is a max-heap: invert so lower (priority, sequence)
        // pops first.
        match self.command.priority.cmp(&other.command.priority) {
            std::cmp::Ordering::Equal => other.sequence.cmp(&self.sequence),
            std::cmp::Ordering::Less => std::cmp::Ordering::Greater,
            std::cmp::Ordering::Greater => std::cmp::Ordering::Less,
        }
    }
}

/// Priority queue ordered by (priority, arrival).
#[derive(Debug, Default)]
pub struct CommandQueue {
    heap: BinaryHeap<QueueItem>,
    sequence: u64,
}

impl CommandQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, command: PendingCommand) {
        let item = QueueItem {
            command,
            sequence: self.sequence,
        };
        self.sequence += 1;
        self.heap.push(item);
    }

    pub fn pop(&mut self) -> Option<PendingCommand> {
        self.heap.pop().map(|item| item.command)
    }

    pub fn len(&self) -> usize {
        self.heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn command(priority: Option<u8>, entity: &str) -> PendingCommand {
        let message = CommandMessage {
            op: Op::Read,
            entity: entity.to_string(),
            device_id: None,
            register_id: None,
            config: None,
            priority,
            minimal: None,
            action: None,
            reason: None,
            reason_detail: None,
            mode: None,
            commands: None,
        };
        PendingCommand {
            id: 0,
            priority: message.priority(),
            message,
            batch: None,
        }
    }

    #[test]
    fn test_parse_create_device() {
        let message = CommandMessage::parse(
            br#"{"op":"create","type":"device","config":{"device_name":"M1","protocol":"RTU"}}"#,
        )
        .unwrap();
        assert_eq!(message.op, Op::Create);
        assert_eq!(message.entity, "device");
        assert!(message.config.is_some());
        assert_eq!(message.priority(), CommandPriority::Normal);
    }

    #[test]
    fn test_parse_batch() {
        let message = CommandMessage::parse(
            br#"{"op":"batch","mode":"atomic","commands":[{"op":"read","type":"device","device_id":"A1B2C3"}]}"#,
        )
        .unwrap();
        assert_eq!(message.op, Op::Batch);
        assert_eq!(message.mode, Some(BatchMode::Atomic));
        assert_eq!(message.commands.as_ref().unwrap().len(), 1);
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(CommandMessage::parse(b"not json").is_err());
        assert!(CommandMessage::parse(br#"{"op":"explode","type":"x"}"#).is_err());
    }

    #[test]
    fn test_priority_order() {
        let mut queue = CommandQueue::new();
        queue.push(command(Some(2), "low"));
        queue.push(command(Some(1), "normal"));
        queue.push(command(Some(0), "high"));

        assert_eq!(queue.pop().unwrap().message.entity, "high");
        assert_eq!(queue.pop().unwrap().message.entity, "normal");
        assert_eq!(queue.pop().unwrap().message.entity, "low");
    }

    #[test]
    fn test_fifo_within_priority() {
        let mut queue = CommandQueue::new();
        queue.push(command(None, "first"));
        queue.push(command(None, "second"));
        queue.push(command(None, "third"));

        assert_eq!(queue.pop().unwrap().message.entity, "first");
        assert_eq!(queue.pop().unwrap().message.entity, "second");
        assert_eq!(queue.pop().unwrap().message.entity, "third");
    }

    #[test]
    fn test_high_priority_jumps_queue() {
        let mut queue = CommandQueue::new();
        queue.push(command(None, "a"));
        queue.push(command(None, "b"));
        queue.push(command(Some(0), "urgent"));

        assert_eq!(queue.pop().unwrap().message.entity, "urgent");
        assert_eq!(queue.pop().unwrap().message.entity, "a");
    }
}
