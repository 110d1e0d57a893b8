use super::{DataStore, Filter, FindOptions, Scope};
use crate::clock::Clock;
use crate::error::StoreResult;
use serde::de::DeserializeOwned;
use serde_json::Value as JsonValue;
use std::collections::VecDeque;
use std::marker::PhantomData;
use std::sync::Arc;

pub const DEFAULT_PAGE_SIZE: usize = 100;

/// Hides documents whose `field` (epoch millis) is not in the future.
#[derive(Clone)]
pub struct NotExpired {
    pub field: &'static str,
    pub clock: Arc<dyn Clock>,
}

/// A lazily evaluated query. Building one touches nothing; every call to `iter`
/// starts over and reads the current state page by page, in insertion order.
pub struct DocumentQuery<T> {
    store: Arc<dyn DataStore>,
    scope: Scope,
    container: &'static str,
    filter: Filter,
    not_expired: Option<NotExpired>,
    page_size: usize,
    _item: PhantomData<fn() -> T>,
}

impl<T: DeserializeOwned> DocumentQuery<T> {
    pub fn new(
        store: Arc<dyn DataStore>,
        scope: Scope,
        container: &'static str,
        filter: Filter,
    ) -> Self {
        Self {
            store,
            scope,
            container,
            filter,
            not_expired: None,
            page_size: DEFAULT_PAGE_SIZE,
            _item: PhantomData,
        }
    }

    pub fn not_expired(mut self, not_expired: NotExpired) -> Self {
        self.not_expired = Some(not_expired);
        self
    }

    pub fn page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size.max(1);
        self
    }

    pub fn iter(&self) -> DocumentIter<'_, T> {
        DocumentIter {
            query: self,
            buffer: VecDeque::new(),
            after_seq: None,
            done: false,
        }
    }

    fn fetch_page(&self, after_seq: Option<i64>) -> StoreResult<Vec<(i64, T)>> {
        let filter = match &self.not_expired {
            Some(not_expired) => self
                .filter
                .clone()
                .gt(not_expired.field, not_expired.clock.now().timestamp_millis()),
            None => self.filter.clone(),
        };
        self.store
            .find(
                &self.scope,
                self.container,
                &filter,
                FindOptions {
                    after_seq,
                    limit: Some(self.page_size),
                },
            )?
            .into_iter()
            .map(|doc| Ok((doc.seq, serde_json::from_value(JsonValue::Object(doc.body))?)))
            .collect()
    }
}

impl<'a, T: DeserializeOwned> IntoIterator for &'a DocumentQuery<T> {
    type Item = StoreResult<T>;
    type IntoIter = DocumentIter<'a, T>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

/// Yields items one page at a time. Stops after the first error.
pub struct DocumentIter<'a, T> {
    query: &'a DocumentQuery<T>,
    buffer: VecDeque<T>,
    after_seq: Option<i64>,
    done: bool,
}

impl<T: DeserializeOwned> Iterator for DocumentIter<'_, T> {
    type Item = StoreResult<T>;

    fn next(&mut self) -> Option<Self::Item> {
        if let Some(item) = self.buffer.pop_front() {
            return Some(Ok(item));
        }
        if self.done {
            return None;
        }
        match self.query.fetch_page(self.after_seq) {
            Ok(page) => {
                if page.len() < self.query.page_size {
                    self.done = true;
                }
                if let Some((seq, _)) = page.last() {
                    self.after_seq = Some(*seq);
                }
                self.buffer.extend(page.into_iter().map(|(_, item)| item));
                self.buffer.pop_front().map(Ok)
            }
            Err(err) => {
                self.done = true;
                Some(Err(err))
            }
        }
    }
}
