//! Captured leads: an append-only list persisted apart from the session.
//!
//! New records are appended only when their summary differs from the last stored one, so
//! redundant capture triggers (closing phrase, backend end flag, explicit end) store a lead once.

use serde_json::Value;

use crate::session::LeadRecord;
use crate::store::{load_typed, Store, StoreError, LEADS_KEY};

/// View over the stored lead list.
pub struct LeadBook<'a, S: Store + ?Sized> {
    store: &'a S,
}

impl<'a, S: Store + ?Sized> LeadBook<'a, S> {
    pub fn new(store: &'a S) -> Self {
        Self { store }
    }

    /// All stored leads, oldest first.
    pub async fn list(&self) -> Result<Vec<LeadRecord>, StoreError> {
        Ok(load_typed(self.store, LEADS_KEY).await?.unwrap_or_default())
    }

    pub async fn get(&self, index: usize) -> Result<Option<LeadRecord>, StoreError> {
        Ok(self.list().await?.into_iter().nth(index))
    }

    /// Append `lead` unless it has no summary or repeats the last stored summary.
    /// Returns whether it was appended. The check and the append are one store update.
    pub async fn append_if_new(&self, lead: &LeadRecord) -> Result<bool, StoreError> {
        if !lead.is_ready() {
            log::debug!("leads: summary not ready, nothing to store");
            return Ok(false);
        }
        let item = serde_json::to_value(lead)?;
        let summary = lead.summary.clone();
        let stored = self
            .store
            .update(LEADS_KEY, move |leads| {
                let last = leads
                    .last()
                    .and_then(|l| l.get("summary"))
                    .and_then(Value::as_str);
                if last == Some(summary.as_str()) {
                    return None;
                }
                leads.push(item);
                Some(leads.len())
            })
            .await?;
        match stored {
            Some(n) => {
                log::info!("leads: stored lead #{}", n);
                Ok(true)
            }
            None => {
                log::debug!("leads: summary matches last stored lead, skipping");
                Ok(false)
            }
        }
    }

    /// Remove the lead at `index`. Returns the removed record, or `None` if out of range.
    pub async fn delete(&self, index: usize) -> Result<Option<LeadRecord>, StoreError> {
        let removed = self
            .store
            .update(LEADS_KEY, move |leads| {
                (index < leads.len()).then(|| leads.remove(index))
            })
            .await?;
        Ok(removed.map(serde_json::from_value::<LeadRecord>).transpose()?)
    }
}
