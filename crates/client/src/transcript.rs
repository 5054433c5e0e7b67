use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::SystemTime;

use arc_swap::ArcSwap;
use snafu::Snafu;
use uuid::Uuid;

/// Stable identifier for one transcript turn.
///
/// Renderers key on this so a streaming turn keeps its element while content grows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TurnId(pub Uuid);

impl TurnId {
    /// Mints a time-ordered identifier.
    pub fn new_v7() -> Self {
        Self(Uuid::now_v7())
    }
}

impl fmt::Display for TurnId {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(formatter, "{}", self.0)
    }
}

/// Transcript speaker role.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    User,
    Assistant,
}

/// One transcript entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Turn {
    pub id: TurnId,
    pub role: Role,
    pub content: String,
    pub created_at: SystemTime,
}

impl Turn {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            id: TurnId::new_v7(),
            role,
            content: content.into(),
            created_at: SystemTime::now(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new(Role::User, content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(Role::Assistant, content)
    }
}

/// Immutable, ordered view of the transcript at one point in time.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Transcript {
    turns: Arc<Vec<Turn>>,
}

impl Transcript {
    pub fn turns(&self) -> &[Turn] {
        &self.turns
    }

    pub fn last(&self) -> Option<&Turn> {
        self.turns.last()
    }

    pub fn len(&self) -> usize {
        self.turns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.turns.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Turn> {
        self.turns.iter()
    }

    /// Returns `(role, content)` pairs, which is what most assertions and renderers need.
    pub fn entries(&self) -> Vec<(Role, &str)> {
        self.turns
            .iter()
            .map(|turn| (turn.role, turn.content.as_str()))
            .collect()
    }
}

impl<'a> IntoIterator for &'a Transcript {
    type Item = &'a Turn;
    type IntoIter = std::slice::Iter<'a, Turn>;

    fn into_iter(self) -> Self::IntoIter {
        self.turns.iter()
    }
}

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum TranscriptError {
    #[snafu(display("last turn does not have role {expected:?} (found {found:?})"))]
    NoMatchingTurn {
        stage: &'static str,
        expected: Role,
        found: Option<Role>,
    },
}

pub type TranscriptResult<T> = Result<T, TranscriptError>;

/// Receives a fresh snapshot after every committed transcript mutation.
///
/// Implementations must not call back into the store that notified them.
pub trait PresentationSink: Send + Sync {
    fn render(&self, transcript: &Transcript);
}

/// Single source of truth for what gets rendered.
///
/// Readers load a snapshot without locking. Writers are serialized so that a
/// check-then-replace on the last turn cannot interleave with another write.
pub struct TranscriptStore {
    current: ArcSwap<Vec<Turn>>,
    write_lock: Mutex<()>,
    sinks: Mutex<Vec<Arc<dyn PresentationSink>>>,
}

impl Default for TranscriptStore {
    fn default() -> Self {
        Self::new()
    }
}

impl TranscriptStore {
    pub fn new() -> Self {
        Self {
            current: ArcSwap::from_pointee(Vec::new()),
            write_lock: Mutex::new(()),
            sinks: Mutex::new(Vec::new()),
        }
    }

    pub fn snapshot(&self) -> Transcript {
        Transcript {
            turns: self.current.load_full(),
        }
    }

    pub fn subscribe(&self, sink: Arc<dyn PresentationSink>) {
        lock(&self.sinks).push(sink);
    }

    /// Adds a turn to the end of the transcript.
    pub fn append(&self, turn: Turn) -> TurnId {
        let _guard = lock(&self.write_lock);
        let id = turn.id;
        let mut turns = Vec::clone(&self.current.load());
        turns.push(turn);
        self.commit(turns);
        id
    }

    /// Replaces the content of the last turn, which must have `role`.
    pub fn update_last(&self, role: Role, content: impl Into<String>) -> TranscriptResult<TurnId> {
        let _guard = lock(&self.write_lock);
        let mut turns = Vec::clone(&self.current.load());
        let found = turns.last().map(|turn| turn.role);

        let Some(last) = turns.last_mut().filter(|turn| turn.role == role) else {
            return NoMatchingTurnSnafu {
                stage: "update-last-turn",
                expected: role,
                found,
            }
            .fail();
        };
        last.content = content.into();
        let id = last.id;
        self.commit(turns);
        Ok(id)
    }

    /// Replaces the last turn's content when both it and `role` are assistant turns;
    /// otherwise appends a new turn. User turns are never overwritten.
    pub fn replace_or_append(&self, role: Role, content: impl Into<String>) -> TurnId {
        let _guard = lock(&self.write_lock);
        let mut turns = Vec::clone(&self.current.load());
        let content = content.into();

        let id = match turns.last_mut() {
            Some(last) if role == Role::Assistant && last.role == Role::Assistant => {
                last.content = content;
                last.id
            }
            _ => {
                let turn = Turn::new(role, content);
                let id = turn.id;
                turns.push(turn);
                id
            }
        };

        self.commit(turns);
        id
    }

    fn commit(&self, turns: Vec<Turn>) {
        let turns = Arc::new(turns);
        self.current.store(Arc::clone(&turns));

        let snapshot = Transcript { turns };
        for sink in lock(&self.sinks).iter() {
            sink.render(&snapshot);
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
