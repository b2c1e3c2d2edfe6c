//! Open Intents
//!
//! Intents whose detail view is open. Each lives from creation until the
//! view closes, and its status only ever moves forward. Terminal statuses
//! are remembered after the view closes so a settled uuid is never polled
//! again.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use tuition_core::{IntentId, PaymentIntent, PaymentStatus, Result};

#[derive(Default)]
struct Book {
    open: HashMap<IntentId, PaymentIntent>,
    settled: HashMap<IntentId, PaymentStatus>,
}

#[derive(Default)]
pub struct IntentBook {
    book: Mutex<Book>,
}

impl IntentBook {
    pub fn new() -> Self {
        Self::default()
    }

    fn guard(&self) -> MutexGuard<'_, Book> {
        self.book.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn open(&self, intent: PaymentIntent) {
        self.guard().open.insert(intent.uuid.clone(), intent);
    }

    pub fn get(&self, uuid: &IntentId) -> Option<PaymentIntent> {
        self.guard().open.get(uuid).cloned()
    }

    pub fn contains(&self, uuid: &IntentId) -> bool {
        self.guard().open.contains_key(uuid)
    }

    /// Move an open intent to `status`.
    ///
    /// `Ok(false)` when the intent is not open or already there; an
    /// `InvalidState` error for a backwards move, which leaves it untouched.
    /// A terminal `status` is recorded for the uuid either way.
    pub fn advance(&self, uuid: &IntentId, status: PaymentStatus) -> Result<bool> {
        let mut book = self.guard();
        let moved = match book.open.get_mut(uuid) {
            Some(intent) => intent.transition(status)?,
            None => false,
        };
        if status.is_terminal() {
            book.settled.entry(uuid.clone()).or_insert(status);
        }
        Ok(moved)
    }

    /// Last terminal status known for `uuid`, open or closed
    pub fn terminal_status(&self, uuid: &IntentId) -> Option<PaymentStatus> {
        let book = self.guard();
        book.open
            .get(uuid)
            .map(|intent| intent.status)
            .filter(PaymentStatus::is_terminal)
            .or_else(|| book.settled.get(uuid).copied())
    }

    pub fn close(&self, uuid: &IntentId) -> Option<PaymentIntent> {
        let mut book = self.guard();
        let intent = book.open.remove(uuid)?;
        if intent.status.is_terminal() {
            book.settled.insert(uuid.clone(), intent.status);
        }
        Some(intent)
    }

    /// Number of open intents
    pub fn len(&self) -> usize {
        self.guard().open.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
