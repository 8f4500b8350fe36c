//! Contact roster
//!
//! Tracks the accounts the bot is connected with on the remote network.
//! Incoming requests are accepted and deduplicated, and higher-level trade
//! flows can wait for a specific contact to appear (the handler fires once
//! and is discarded).

use chrono::{DateTime, Utc};
use tracing::debug;

use crate::types::AccountId;

#[derive(Debug, Clone)]
pub struct Contact {
    pub account: AccountId,
    pub since: DateTime<Utc>,
}

type Waiter = (AccountId, Box<dyn FnOnce() + Send>);

#[derive(Default)]
pub struct ContactRoster {
    contacts: Vec<Contact>,
    waiters: Vec<Waiter>,
}

impl ContactRoster {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed the roster from a previously persisted contact list
    pub fn seed(&mut self, contacts: Vec<Contact>) {
        self.contacts = contacts;
    }

    /// Record a new (or re-added) contact and fire any waiters for it
    pub fn add(&mut self, account: &str) {
        // Unpopulate first in case of dupes
        self.remove(account);
        debug!(account, "contact added");
        self.contacts.push(Contact {
            account: account.to_string(),
            since: Utc::now(),
        });
        let mut i = 0;
        while i < self.waiters.len() {
            if self.waiters[i].0 == account {
                let (_, callback) = self.waiters.remove(i);
                callback();
            } else {
                i += 1;
            }
        }
    }

    pub fn remove(&mut self, account: &str) {
        self.contacts.retain(|contact| contact.account != account);
    }

    pub fn contains(&self, account: &str) -> bool {
        self.contacts.iter().any(|c| c.account == account)
    }

    pub fn get(&self, account: &str) -> Option<&Contact> {
        self.contacts.iter().find(|c| c.account == account)
    }

    pub fn len(&self) -> usize {
        self.contacts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.contacts.is_empty()
    }

    /// Fire `callback` once, as soon as `account` is (or becomes) a contact
    pub fn on_contact_with<F: FnOnce() + Send + 'static>(&mut self, account: &str, callback: F) {
        if self.contains(account) {
            callback();
        } else {
            self.waiters.push((account.to_string(), Box::new(callback)));
        }
    }

    /// Longest-standing contact not on the whitelist; used to pick an
    /// eviction candidate when the roster is full
    pub fn oldest(&self, whitelist: &[&str]) -> Option<&Contact> {
        self.contacts
            .iter()
            .filter(|c| !whitelist.contains(&c.account.as_str()))
            .min_by_key(|c| c.since)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn test_add_deduplicates() {
        let mut roster = ContactRoster::new();
        roster.add("user-a");
        roster.add("user-a");
        assert_eq!(roster.len(), 1);
    }

    #[test]
    fn test_waiter_fires_once_on_add() {
        let mut roster = ContactRoster::new();
        let fired = Arc::new(AtomicUsize::new(0));
        let f = fired.clone();
        roster.on_contact_with("user-a", move || {
            f.fetch_add(1, Ordering::SeqCst);
        });

        assert_eq!(fired.load(Ordering::SeqCst), 0);
        roster.add("user-a");
        assert_eq!(fired.load(Ordering::SeqCst), 1);

        // Re-adding must not replay the waiter
        roster.add("user-a");
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_waiter_fires_immediately_for_existing_contact() {
        let mut roster = ContactRoster::new();
        roster.add("user-a");
        let fired = Arc::new(AtomicUsize::new(0));
        let f = fired.clone();
        roster.on_contact_with("user-a", move || {
            f.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_oldest_honors_whitelist() {
        let mut roster = ContactRoster::new();
        roster.seed(vec![
            Contact {
                account: "old".to_string(),
                since: Utc::now() - chrono::Duration::days(30),
            },
            Contact {
                account: "older".to_string(),
                since: Utc::now() - chrono::Duration::days(60),
            },
            Contact {
                account: "new".to_string(),
                since: Utc::now(),
            },
        ]);

        assert_eq!(roster.oldest(&[]).unwrap().account, "older");
        assert_eq!(roster.oldest(&["older"]).unwrap().account, "old");
        assert!(roster.oldest(&["older", "old", "new"]).is_none());
    }
}
