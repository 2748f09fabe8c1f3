//! Pending-response correlation
//!
//! Maps an expected inbound command to the callers waiting for it. Each
//! command has at most one entry with its own deadline; waiters are
//! released in the order they registered.

use crate::network::error::PeerError;
use crate::network::message::{Command, Message};
use std::collections::{BTreeMap, VecDeque};
use tokio::sync::oneshot;
use tokio::time::Instant;

/// Receives the awaited message, or the error that ended the session
pub type ResponseWaiter = oneshot::Sender<Result<Message, PeerError>>;

/// One expected response
#[derive(Debug)]
pub struct ResponseEntry {
    pub deadline: Instant,
    waiters: VecDeque<ResponseWaiter>,
}

impl ResponseEntry {
    fn new(deadline: Instant) -> Self {
        Self {
            deadline,
            waiters: VecDeque::new(),
        }
    }

    pub fn waiters(&self) -> usize {
        self.waiters.len()
    }

    fn resolve(self, msg: &Message) {
        for waiter in self.waiters {
            let _ = waiter.send(Ok(msg.clone()));
        }
    }

    fn reject(self, err: &PeerError) {
        for waiter in self.waiters {
            let _ = waiter.send(Err(err.clone()));
        }
    }
}

/// Whether a message also satisfies the synthetic `data` entry
fn is_data(cmd: Command) -> bool {
    matches!(
        cmd,
        Command::Block | Command::CmpctBlock | Command::MerkleBlock | Command::Tx | Command::NotFound
    )
}

/// Pending responses, iterated in command-id order
#[derive(Debug, Default)]
pub struct ResponseTable {
    entries: BTreeMap<Command, ResponseEntry>,
}

impl ResponseTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains(&self, cmd: Command) -> bool {
        self.entries.contains_key(&cmd)
    }

    pub fn get(&self, cmd: Command) -> Option<&ResponseEntry> {
        self.entries.get(&cmd)
    }

    /// Expect `cmd` by `deadline`, creating the entry or moving its deadline
    pub fn request(&mut self, cmd: Command, deadline: Instant) -> &mut ResponseEntry {
        let entry = self
            .entries
            .entry(cmd)
            .or_insert_with(|| ResponseEntry::new(deadline));
        entry.deadline = deadline;
        entry
    }

    /// Register a waiter for `cmd`. The `data` entry takes one caller;
    /// a second is rejected.
    pub fn wait(&mut self, cmd: Command, deadline: Instant, waiter: ResponseWaiter) {
        if cmd == Command::Data && self.get(cmd).map_or(false, |entry| entry.waiters() > 0) {
            log::warn!("Rejecting second waiter on {}", cmd);
            let _ = waiter.send(Err(PeerError::AlreadyWaiting(cmd)));
            return;
        }
        self.request(cmd, deadline).waiters.push_back(waiter);
    }

    /// Drop the entry for `cmd` without resolving anyone
    pub fn remove(&mut self, cmd: Command) -> Option<ResponseEntry> {
        self.entries.remove(&cmd)
    }

    /// Release everyone waiting for this message. Returns the number of
    /// waiters resolved.
    pub fn fulfill(&mut self, msg: &Message) -> usize {
        let cmd = msg.command();
        let mut resolved = 0;

        if is_data(cmd) {
            if let Some(entry) = self.entries.remove(&Command::Data) {
                assert!(entry.waiters() <= 1, "data entry with queued waiters");
                resolved += entry.waiters();
                entry.resolve(msg);
            }
        }

        if let Some(entry) = self.entries.remove(&cmd) {
            resolved += entry.waiters();
            entry.resolve(msg);
        }

        resolved
    }

    /// First entry (in command order) whose deadline has passed
    pub fn expired(&self, now: Instant) -> Option<Command> {
        self.entries
            .iter()
            .find(|(_, entry)| now > entry.deadline)
            .map(|(cmd, _)| *cmd)
    }

    /// Fail every waiter and clear the table
    pub fn reject_all(&mut self, err: &PeerError) {
        for (_, entry) in std::mem::take(&mut self.entries) {
            entry.reject(err);
        }
    }
}
