//! Registration table mapping poll tokens to handlers.
//!
//! Each registered channel gets a unique token from a slab. When readiness
//! arrives the token identifies the handler and the interest set it was
//! registered under.

use crate::runtime::dispatcher::{EventHandler, Interest};
use mio::Token;
use slab::Slab;
use std::sync::Arc;

/// Reserved for the dispatcher's waker.
pub const WAKER_TOKEN: Token = Token(usize::MAX);

/// A channel's binding to its owning handler.
#[derive(Clone)]
pub struct Registration {
    pub handler: Arc<dyn EventHandler>,
    pub interest: Interest,
}

impl Registration {
    /// Whether this registration belongs to `handler`, by identity.
    pub fn is_for(&self, handler: &dyn EventHandler) -> bool {
        same_handler(&*self.handler, handler)
    }
}

/// Pointer identity for trait objects, ignoring vtables.
pub fn same_handler(a: &dyn EventHandler, b: &dyn EventHandler) -> bool {
    std::ptr::eq(
        a as *const dyn EventHandler as *const (),
        b as *const dyn EventHandler as *const (),
    )
}

/// Slab of registrations with O(1) lookup by token.
pub struct RegistrationTable {
    entries: Slab<Registration>,
}

impl RegistrationTable {
    pub fn new() -> Self {
        Self {
            entries: Slab::new(),
        }
    }

    /// Token the next `insert` will return.
    pub fn next_token(&self) -> Token {
        Token(self.entries.vacant_key())
    }

    pub fn insert(&mut self, registration: Registration) -> Token {
        Token(self.entries.insert(registration))
    }

    pub fn get(&self, token: Token) -> Option<&Registration> {
        self.entries.get(token.0)
    }

    /// Remove every registration owned by `handler`, returning them.
    pub fn remove_handler(&mut self, handler: &dyn EventHandler) -> Vec<Registration> {
        let tokens: Vec<usize> = self
            .entries
            .iter()
            .filter(|(_, reg)| reg.is_for(handler))
            .map(|(key, _)| key)
            .collect();

        tokens
            .into_iter()
            .map(|key| self.entries.remove(key))
            .collect()
    }

    /// Whether `token` still maps to `handler`.
    pub fn is_current(&self, token: Token, handler: &dyn EventHandler) -> bool {
        self.get(token).is_some_and(|reg| reg.is_for(handler))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl Default for RegistrationTable {
    fn default() -> Self {
        Self::new()
    }
}
