//! Per-transaction savepoint stack.

use crate::error::{CoreError, CoreResult};
use crate::types::LogInstant;

/// Who created a savepoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SavepointKind {
    /// Set by the engine itself.
    Internal,
    /// Set with an SQL `SAVEPOINT` statement.
    Sql,
    /// Set through a client API.
    Jdbc,
}

impl SavepointKind {
    /// Whether the savepoint was set by a user.
    #[must_use]
    pub const fn is_user(self) -> bool {
        !matches!(self, Self::Internal)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct Savepoint {
    name: String,
    kind: SavepointKind,
    /// First log record written after the savepoint, filled lazily.
    position: Option<LogInstant>,
}

/// Ordered stack of named rollback points.
#[derive(Debug, Default)]
pub(crate) struct SavepointStack {
    frames: Vec<Savepoint>,
}

impl SavepointStack {
    pub(crate) fn len(&self) -> usize {
        self.frames.len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    pub(crate) fn clear(&mut self) {
        self.frames.clear();
    }

    /// Pushes a savepoint and returns the new depth.
    pub(crate) fn push(&mut self, name: &str, kind: SavepointKind) -> CoreResult<usize> {
        // SQL savepoints cannot nest inside other user savepoints
        if kind == SavepointKind::Sql && self.frames.iter().any(|sp| sp.kind.is_user()) {
            return Err(CoreError::SavepointNesting {
                name: name.to_owned(),
            });
        }
        if self.position(name, kind, false).is_some() {
            return Err(CoreError::SavepointExists {
                name: name.to_owned(),
            });
        }
        self.frames.push(Savepoint {
            name: name.to_owned(),
            kind,
            position: None,
        });
        Ok(self.frames.len())
    }

    /// Finds the topmost savepoint called `name`.
    ///
    /// For rollback or release a user savepoint must also match `kind`;
    /// internal savepoints match on name alone.
    pub(crate) fn position(
        &self,
        name: &str,
        kind: SavepointKind,
        for_rollback_or_release: bool,
    ) -> Option<usize> {
        self.frames.iter().rposition(|sp| {
            sp.name == name && (!for_rollback_or_release || !sp.kind.is_user() || sp.kind == kind)
        })
    }

    pub(crate) fn find(&self, name: &str, kind: SavepointKind) -> CoreResult<usize> {
        self.position(name, kind, true)
            .ok_or_else(|| CoreError::SavepointNotFound {
                name: name.to_owned(),
            })
    }

    /// Drops the savepoint at `position` and everything above it.
    pub(crate) fn release(&mut self, position: usize) -> usize {
        self.frames.truncate(position);
        self.frames.len()
    }

    /// Drops everything above `position`, keeping the savepoint itself, and
    /// returns where undo has to start, if anything was logged since.
    pub(crate) fn truncate_for_rollback(&mut self, position: usize) -> Option<LogInstant> {
        let rollback_to = self.frames[position..]
            .iter()
            .find_map(|sp| sp.position);
        self.frames.truncate(position + 1);
        rollback_to
    }

    /// Assigns `instant` to the savepoints set since the last logged record.
    pub(crate) fn record_logged(&mut self, instant: LogInstant) {
        for sp in self.frames.iter_mut().rev() {
            if sp.position.is_some() {
                break;
            }
            sp.position = Some(instant);
        }
    }

    /// Assigns `instant` to the top savepoint if it has no position yet.
    pub(crate) fn record_compensation(&mut self, instant: LogInstant) {
        if let Some(top) = self.frames.last_mut() {
            if top.position.is_none() {
                top.position = Some(instant);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn push_returns_depth() {
        let mut stack = SavepointStack::default();
        assert_eq!(stack.push("a", SavepointKind::Internal).unwrap(), 1);
        assert_eq!(stack.push("b", SavepointKind::Jdbc).unwrap(), 2);
        assert_eq!(stack.len(), 2);
    }

    #[test]
    fn duplicate_names_are_rejected() {
        let mut stack = SavepointStack::default();
        stack.push("a", SavepointKind::Internal).unwrap();
        let err = stack.push("a", SavepointKind::Jdbc).unwrap_err();
        assert!(matches!(err, CoreError::SavepointExists { .. }));
    }

    #[test]
    fn sql_savepoints_do_not_nest() {
        let mut stack = SavepointStack::default();
        stack.push("internal", SavepointKind::Internal).unwrap();
        stack.push("s1", SavepointKind::Sql).unwrap();
        let err = stack.push("s2", SavepointKind::Sql).unwrap_err();
        assert!(matches!(err, CoreError::SavepointNesting { .. }));
        // client savepoints may still nest
        stack.push("j1", SavepointKind::Jdbc).unwrap();
    }

    #[test]
    fn rollback_lookup_matches_kind() {
        let mut stack = SavepointStack::default();
        stack.push("sp", SavepointKind::Jdbc).unwrap();
        assert!(stack.find("sp", SavepointKind::Sql).is_err());
        assert_eq!(stack.find("sp", SavepointKind::Jdbc).unwrap(), 0);

        let mut internal = SavepointStack::default();
        internal.push("sp", SavepointKind::Internal).unwrap();
        assert_eq!(internal.find("sp", SavepointKind::Sql).unwrap(), 0);
    }

    #[test]
    fn positions_fill_lazily() {
        let mut stack = SavepointStack::default();
        stack.push("a", SavepointKind::Internal).unwrap();
        stack.record_logged(LogInstant(10));
        stack.push("b", SavepointKind::Internal).unwrap();
        stack.push("c", SavepointKind::Internal).unwrap();
        stack.record_logged(LogInstant(20));
        stack.record_logged(LogInstant(30));

        let mut copy = SavepointStack {
            frames: stack.frames.clone(),
        };
        assert_eq!(copy.truncate_for_rollback(1), Some(LogInstant(20)));
        assert_eq!(copy.len(), 2);
        assert_eq!(stack.truncate_for_rollback(0), Some(LogInstant(10)));
        assert_eq!(stack.len(), 1);
    }

    #[test]
    fn rollback_without_logging_is_empty() {
        let mut stack = SavepointStack::default();
        stack.push("a", SavepointKind::Internal).unwrap();
        assert_eq!(stack.truncate_for_rollback(0), None);
        stack.record_compensation(LogInstant(5));
        assert_eq!(stack.truncate_for_rollback(0), Some(LogInstant(5)));
    }

    #[test]
    fn release_drops_the_savepoint() {
        let mut stack = SavepointStack::default();
        stack.push("a", SavepointKind::Internal).unwrap();
        stack.push("b", SavepointKind::Internal).unwrap();
        assert_eq!(stack.release(1), 1);
        assert!(stack.position("b", SavepointKind::Internal, true).is_none());
        assert_eq!(stack.release(0), 0);
        assert!(stack.is_empty());
    }
}
