use std::sync::Arc;

use bytes::Bytes;
use tracing::trace;

use crate::common::{ArborError, CursorMode, Result};
use crate::index::{BTreeIndex, Position, SeekBound};

use super::database::DbHandle;

#[derive(Debug, Clone)]
enum CursorState {
    /// Created or reset; `Next`/`Prev` start from the matching end
    Unset,
    /// Last returned entry. The key is authoritative: the slot is only a
    /// hint that is re-checked on every step.
    Positioned { pos: Position, key: Bytes },
    /// Moved past either end; only `First`/`Last` leave this state
    Exhausted,
}

/// Positional reader over a [`crate::Database`].
///
/// A cursor takes the file's read lock only for the duration of each call.
/// Between calls other handles may insert or delete; the cursor relocates
/// itself by its last key, so `Next` yields the smallest surviving key after
/// it and `Prev` the largest one before it.
pub struct Cursor {
    handle: Arc<DbHandle>,
    state: CursorState,
}

impl Cursor {
    pub(crate) fn new(handle: Arc<DbHandle>) -> Self {
        Self {
            handle,
            state: CursorState::Unset,
        }
    }

    /// Moves the cursor and returns the pair it lands on, or `None` at the end
    /// of the sequence.
    ///
    /// `Current` re-reads the last returned key and fails with
    /// [`ArborError::NotFound`] if it has since been deleted.
    pub fn get(&mut self, mode: CursorMode) -> Result<Option<(Bytes, Bytes)>> {
        let file = self.handle.file()?;
        file.run_read(|tree| self.step(tree, mode))
    }

    /// Positions the cursor on the smallest key `>= key`.
    pub fn seek(&mut self, key: &[u8]) -> Result<Option<(Bytes, Bytes)>> {
        if key.is_empty() {
            return Err(ArborError::invalid("key must not be empty"));
        }
        let file = self.handle.file()?;
        file.run_read(|tree| {
            let target = tree.seek(key, SeekBound::AtOrAfter)?;
            self.land(tree, target)
        })
    }

    /// Forgets the position; the next `Next` starts from the first key.
    pub fn reset(&mut self) {
        self.state = CursorState::Unset;
    }

    pub fn is_exhausted(&self) -> bool {
        matches!(self.state, CursorState::Exhausted)
    }

    fn step(&mut self, tree: &BTreeIndex, mode: CursorMode) -> Result<Option<(Bytes, Bytes)>> {
        let target = match (mode, &self.state) {
            (CursorMode::First, _) | (CursorMode::Next, CursorState::Unset) => tree.get_first()?,
            (CursorMode::Last, _) | (CursorMode::Prev, CursorState::Unset) => tree.get_last()?,
            (CursorMode::Next | CursorMode::Prev, CursorState::Exhausted) => return Ok(None),
            (CursorMode::Next, CursorState::Positioned { pos, key }) => {
                if still_at(tree, *pos, key)? {
                    tree.next_position(*pos)?
                } else {
                    trace!("cursor.relocate.next");
                    tree.seek(key, SeekBound::After)?
                }
            }
            (CursorMode::Prev, CursorState::Positioned { pos, key }) => {
                if still_at(tree, *pos, key)? {
                    tree.prev_position(*pos)?
                } else {
                    trace!("cursor.relocate.prev");
                    tree.seek(key, SeekBound::Before)?
                }
            }
            (CursorMode::Current, CursorState::Positioned { pos, key }) => {
                if still_at(tree, *pos, key)? {
                    Some(*pos)
                } else {
                    let found = tree.search(key)?;
                    if !found.found {
                        return Err(ArborError::NotFound);
                    }
                    Some(Position {
                        page_id: found.page_id,
                        slot: found.slot,
                    })
                }
            }
            (CursorMode::Current, _) => {
                return Err(ArborError::invalid("cursor is not positioned"));
            }
        };
        self.land(tree, target)
    }

    fn land(
        &mut self,
        tree: &BTreeIndex,
        target: Option<Position>,
    ) -> Result<Option<(Bytes, Bytes)>> {
        let Some(pos) = target else {
            self.state = CursorState::Exhausted;
            return Ok(None);
        };
        let entry = tree.entry_at(pos)?.ok_or_else(|| {
            ArborError::corruption(format!(
                "no entry at slot {} of {}",
                pos.slot, pos.page_id
            ))
        })?;
        self.state = CursorState::Positioned {
            pos,
            key: entry.key.clone(),
        };
        Ok(Some((entry.key, entry.value)))
    }
}

/// Whether the slot still holds `key`.
fn still_at(tree: &BTreeIndex, pos: Position, key: &[u8]) -> Result<bool> {
    Ok(tree
        .entry_at(pos)?
        .is_some_and(|entry| entry.key.as_ref() == key))
}

impl std::fmt::Debug for Cursor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Cursor").field("state", &self.state).finish()
    }
}

/// Forward iterator over every pair, built on a [`Cursor`].
pub struct Iter {
    cursor: Cursor,
    done: bool,
}

impl Iterator for Iter {
    type Item = Result<(Bytes, Bytes)>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        match self.cursor.get(CursorMode::Next) {
            Ok(Some(pair)) => Some(Ok(pair)),
            Ok(None) => {
                self.done = true;
                None
            }
            Err(err) => {
                self.done = true;
                Some(Err(err))
            }
        }
    }
}

impl IntoIterator for Cursor {
    type Item = Result<(Bytes, Bytes)>;
    type IntoIter = Iter;

    fn into_iter(self) -> Iter {
        Iter {
            cursor: self,
            done: false,
        }
    }
}
