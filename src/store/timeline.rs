//! Timeline Store - paginated event log of the live conversation
//!
//! The loaded window is always ordered by strictly increasing
//! `sequence_number` with no duplicate ids. The window is bounded by
//! `max_events`; whenever events are dropped to honour the bound the matching
//! `has_earlier` / `has_later` flag is raised so the UI can offer to reload them.
//!
//! Async loads are tagged with a generation number. `get_timeline`,
//! `clear_timeline` and `restore` start a new generation, and a response is
//! only applied if its generation is still current (last request wins).

use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use super::Store;
use crate::config::TimelineConfig;
use crate::core::errors::TimelineError;
use crate::core::traits::TimelineService;
use crate::core::types::{TimelineEvent, TimelinePage};

const LOAD_FALLBACK: &str = "Failed to load timeline";
const LOAD_EARLIER_FALLBACK: &str = "Failed to load earlier messages";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TimelineState {
    pub conversation_id: Option<String>,
    pub events: Vec<TimelineEvent>,
    /// Sequence number of the oldest loaded event
    pub earliest_sequence: Option<i64>,
    /// Sequence number of the newest loaded event
    pub latest_sequence: Option<i64>,
    /// Older events exist server-side beyond the window
    pub has_earlier: bool,
    /// Newer events were dropped from the window by backward pagination
    pub has_later: bool,
    pub is_loading: bool,
    /// Background pagination; independent of the primary loading indicator
    pub is_loading_earlier: bool,
    pub error: Option<String>,
}

impl TimelineState {
    fn last_sequence(&self) -> i64 {
        self.latest_sequence
            .or_else(|| self.events.last().map(|e| e.sequence_number))
            .unwrap_or(0)
    }

    fn contains_id(&self, id: &str) -> bool {
        self.events.iter().any(|e| e.id == id)
    }
}

/// Outcome of an async timeline load
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimelineLoad {
    /// The response was applied to the store
    Applied,
    /// A newer load superseded this one; the response was discarded
    Stale,
}

/// Observable timeline of the live conversation
#[derive(Clone)]
pub struct TimelineStore {
    store: Store<TimelineState>,
    service: Arc<dyn TimelineService>,
    generation: Arc<AtomicU64>,
    page_size: usize,
    max_events: usize,
}

impl std::fmt::Debug for TimelineStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TimelineStore")
            .field("page_size", &self.page_size)
            .field("max_events", &self.max_events)
            .field("state", &self.store.get_state())
            .finish()
    }
}

impl TimelineStore {
    pub fn new(service: Arc<dyn TimelineService>, config: &TimelineConfig) -> Self {
        Self {
            store: Store::new("timeline", TimelineState::default()),
            service,
            generation: Arc::new(AtomicU64::new(0)),
            page_size: config.page_size.max(1),
            max_events: config.max_events.max(1),
        }
    }

    pub fn store(&self) -> &Store<TimelineState> {
        &self.store
    }

    pub fn state(&self) -> TimelineState {
        self.store.get_state()
    }

    pub fn events(&self) -> Vec<TimelineEvent> {
        self.store.with_state(|s| s.events.clone())
    }

    pub fn len(&self) -> usize {
        self.store.with_state(|s| s.events.len())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn max_events(&self) -> usize {
        self.max_events
    }

    /// Load the newest page of a conversation, replacing the whole timeline
    pub async fn get_timeline(
        &self,
        conversation_id: &str,
        project_id: &str,
    ) -> Result<TimelineLoad, TimelineError> {
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        self.store.set_state(|s| {
            s.is_loading = true;
            s.is_loading_earlier = false;
            s.error = None;
        });

        let result = self
            .service
            .fetch_timeline(conversation_id, project_id, self.page_size, None)
            .await;

        if self.generation.load(Ordering::SeqCst) != generation {
            tracing::debug!(
                "Discarding stale timeline response for conversation {}",
                conversation_id
            );
            return Ok(TimelineLoad::Stale);
        }

        match result {
            Ok(page) => {
                let max_events = self.max_events;
                self.store.set_state(|s| {
                    apply_full_page(s, conversation_id, page, max_events);
                    s.is_loading = false;
                });
                tracing::debug!(
                    "Loaded timeline for conversation {} ({} events)",
                    conversation_id,
                    self.len()
                );
                Ok(TimelineLoad::Applied)
            }
            Err(err) => {
                let message = err.message_or(LOAD_FALLBACK);
                tracing::warn!("Timeline load failed: {}", message);
                self.store.set_state(|s| {
                    s.is_loading = false;
                    s.error = Some(message);
                });
                Err(TimelineError::Load(err))
            }
        }
    }

    /// Fetch the page before the earliest loaded event and prepend it
    ///
    /// Returns `Ok(false)` without any I/O when no earlier cursor is known or a
    /// backward load is already running.
    pub async fn load_earlier_messages(
        &self,
        conversation_id: &str,
        project_id: &str,
    ) -> Result<bool, TimelineError> {
        let cursor = self.store.set_state_quiet(|s| {
            if s.is_loading_earlier {
                return None;
            }
            let cursor = s.earliest_sequence?;
            s.is_loading_earlier = true;
            Some(cursor)
        });
        let Some(before) = cursor else {
            tracing::debug!("load_earlier_messages skipped: no cursor or load in flight");
            return Ok(false);
        };
        self.store.notify();
        let generation = self.generation.load(Ordering::SeqCst);

        let result = self
            .service
            .fetch_timeline(conversation_id, project_id, self.page_size, Some(before))
            .await;

        if self.generation.load(Ordering::SeqCst) != generation {
            tracing::debug!("Discarding stale earlier-page response");
            return Ok(false);
        }

        match result {
            Ok(page) => {
                let max_events = self.max_events;
                self.store.set_state(|s| {
                    let first = page
                        .first_sequence
                        .or_else(|| page.timeline.first().map(|e| e.sequence_number));
                    prepend_events(s, page.timeline, max_events);
                    if let Some(first) = first {
                        s.earliest_sequence = Some(first);
                    }
                    s.has_earlier = page.has_more;
                    s.is_loading_earlier = false;
                });
                Ok(true)
            }
            Err(err) => {
                let message = err.message_or(LOAD_EARLIER_FALLBACK);
                tracing::warn!("Loading earlier messages failed: {}", message);
                self.store.set_state(|s| {
                    s.is_loading_earlier = false;
                    s.error = Some(message);
                });
                Err(TimelineError::LoadEarlier(err))
            }
        }
    }

    /// Append a live event
    ///
    /// Events without a sequence number get `latest + 1`. Returns `false` when
    /// the event was rejected (duplicate id, out-of-order sequence, or the
    /// window no longer reaches the live edge).
    pub fn add_timeline_event(&self, event: TimelineEvent) -> bool {
        let max_events = self.max_events;
        self.store.set_state(|s| append_event(s, event, max_events))
    }

    /// Insert older events at the front; returns how many were inserted
    pub fn prepend_timeline_events(&self, events: Vec<TimelineEvent>) -> usize {
        let max_events = self.max_events;
        self.store
            .set_state(|s| prepend_events(s, events, max_events))
    }

    /// Empty the timeline and reset cursors (conversation switch-out)
    pub fn clear_timeline(&self) {
        self.generation.fetch_add(1, Ordering::SeqCst);
        self.store.replace(TimelineState::default());
    }

    pub fn snapshot(&self) -> TimelineState {
        let mut state = self.store.get_state();
        state.is_loading = false;
        state.is_loading_earlier = false;
        state
    }

    pub fn restore(&self, state: TimelineState) {
        self.restore_quiet(state);
        self.store.notify();
    }

    pub(crate) fn restore_quiet(&self, state: TimelineState) {
        self.generation.fetch_add(1, Ordering::SeqCst);
        self.store.set_state_quiet(|s| *s = state);
    }
}

/// Replace the window with a freshly fetched newest page
fn apply_full_page(
    s: &mut TimelineState,
    conversation_id: &str,
    page: TimelinePage,
    max_events: usize,
) {
    let mut events = normalize(page.timeline);
    let mut trimmed = false;
    if events.len() > max_events {
        let excess = events.len() - max_events;
        events.drain(..excess);
        trimmed = true;
    }

    s.earliest_sequence = if trimmed {
        events.first().map(|e| e.sequence_number)
    } else {
        page.first_sequence
            .or_else(|| events.first().map(|e| e.sequence_number))
    };
    s.latest_sequence = page
        .last_sequence
        .or_else(|| events.last().map(|e| e.sequence_number));
    s.has_earlier = page.has_more || trimmed;
    s.has_later = false;
    s.conversation_id = Some(conversation_id.to_string());
    s.events = events;
}

fn append_event(s: &mut TimelineState, mut event: TimelineEvent, max_events: usize) -> bool {
    if s.has_later {
        tracing::debug!(
            "Skipping live event {}: window does not reach the live edge",
            event.id
        );
        return false;
    }
    if s.contains_id(&event.id) {
        tracing::debug!("Ignoring duplicate timeline event {}", event.id);
        return false;
    }

    let last = s.last_sequence();
    if event.sequence_number <= 0 {
        event.sequence_number = last + 1;
    } else if event.sequence_number <= last {
        tracing::warn!(
            "Rejecting out-of-order timeline event {} (sequence {} <= {})",
            event.id,
            event.sequence_number,
            last
        );
        return false;
    }

    s.latest_sequence = Some(event.sequence_number);
    if s.earliest_sequence.is_none() {
        s.earliest_sequence = Some(event.sequence_number);
    }
    s.events.push(event);

    if s.events.len() > max_events {
        let excess = s.events.len() - max_events;
        s.events.drain(..excess);
        s.earliest_sequence = s.events.first().map(|e| e.sequence_number);
        s.has_earlier = true;
    }
    true
}

fn prepend_events(s: &mut TimelineState, events: Vec<TimelineEvent>, max_events: usize) -> usize {
    let earliest = s
        .earliest_sequence
        .or_else(|| s.events.first().map(|e| e.sequence_number));
    let known: HashSet<String> = s.events.iter().map(|e| e.id.clone()).collect();

    let older: Vec<TimelineEvent> = normalize(events)
        .into_iter()
        .filter(|e| !known.contains(&e.id))
        .filter(|e| earliest.map_or(true, |first| e.sequence_number < first))
        .collect();
    let inserted = older.len();
    if inserted == 0 {
        return 0;
    }

    s.events.splice(0..0, older);
    s.earliest_sequence = s.events.first().map(|e| e.sequence_number);
    if s.latest_sequence.is_none() {
        s.latest_sequence = s.events.last().map(|e| e.sequence_number);
    }

    if s.events.len() > max_events {
        s.events.truncate(max_events);
        s.latest_sequence = s.events.last().map(|e| e.sequence_number);
        s.has_later = true;
    }
    inserted
}

/// Sort by sequence number and drop repeated ids
fn normalize(mut events: Vec<TimelineEvent>) -> Vec<TimelineEvent> {
    events.sort_by_key(|e| e.sequence_number);
    let mut seen = HashSet::new();
    let mut last_sequence = None;
    events.retain(|e| {
        let fresh = seen.insert(e.id.clone()) && last_sequence != Some(e.sequence_number);
        if fresh {
            last_sequence = Some(e.sequence_number);
        }
        fresh
    });
    events
}
