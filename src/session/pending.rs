//! In-flight configuration requests.
//!
//! At most one request per setting kind: a new request for the same kind
//! supersedes the old one instead of queuing behind it.

use crate::domain::models::SettingKind;
use std::collections::HashMap;
use tokio::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestKind {
    Refresh,
    Change,
}

#[derive(Debug, Clone)]
pub struct PendingRequest {
    pub id: u32,
    pub setting: SettingKind,
    pub request: RequestKind,
    pub deadline: Instant,
}

#[derive(Default)]
pub struct PendingTable {
    next_id: u32,
    by_setting: HashMap<SettingKind, PendingRequest>,
}

impl PendingTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a request for `setting`, superseding any prior one for the
    /// same kind. Returns the assigned request id.
    pub fn insert(&mut self, setting: SettingKind, request: RequestKind, deadline: Instant) -> u32 {
        self.next_id = self.next_id.wrapping_add(1);
        let id = self.next_id;
        self.by_setting.insert(
            setting,
            PendingRequest {
                id,
                setting,
                request,
                deadline,
            },
        );
        id
    }

    /// Resolve by correlation id (command acks).
    pub fn resolve_by_id(&mut self, id: u32) -> Option<PendingRequest> {
        let setting = self
            .by_setting
            .values()
            .find(|p| p.id == id)
            .map(|p| p.setting)?;
        self.by_setting.remove(&setting)
    }

    /// Resolve a pending refresh for `setting`, if one exists. A reported
    /// value does not resolve a pending *change* — only its ack does.
    pub fn resolve_refresh(&mut self, setting: SettingKind) -> Option<PendingRequest> {
        match self.by_setting.get(&setting) {
            Some(p) if p.request == RequestKind::Refresh => self.by_setting.remove(&setting),
            _ => None,
        }
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        self.by_setting.values().map(|p| p.deadline).min()
    }

    /// Remove and return every request whose deadline has passed.
    pub fn expire(&mut self, now: Instant) -> Vec<PendingRequest> {
        let expired: Vec<SettingKind> = self
            .by_setting
            .values()
            .filter(|p| p.deadline <= now)
            .map(|p| p.setting)
            .collect();
        expired
            .into_iter()
            .filter_map(|setting| self.by_setting.remove(&setting))
            .collect()
    }

    /// Drop everything, returning the abandoned requests.
    pub fn clear(&mut self) -> Vec<PendingRequest> {
        self.by_setting.drain().map(|(_, p)| p).collect()
    }

    pub fn is_empty(&self) -> bool {
        self.by_setting.is_empty()
    }
}
