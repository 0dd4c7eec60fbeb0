//! Cursor for navigating a bounded event sequence.
//!
//! A fresh cursor sits before the first event: the first `step_forward`
//! lands on index 0. Stepping never leaves `[0, len)`.

/// Cursor position in an event sequence
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Cursor {
    position: Option<u64>,
    len: u64,
    /// Direction of the last move
    pub direction: Direction,
}

/// Direction for cursor movement
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Toward higher indices
    Forward,
    /// Toward lower indices
    Backward,
}

impl Cursor {
    /// Cursor before the first of `len` events
    #[must_use]
    pub fn new(len: u64) -> Self {
        Self {
            position: None,
            len,
            direction: Direction::Forward,
        }
    }

    /// Cursor on `position`, clamped to the last event
    #[must_use]
    pub fn at(position: u64, len: u64) -> Self {
        let mut cursor = Self::new(len);
        if len > 0 {
            cursor.seek(position.min(len - 1));
        }
        cursor
    }

    /// Move one step forward; `None` at the end
    pub fn step_forward(&mut self) -> Option<u64> {
        self.direction = Direction::Forward;
        let next = match self.position {
            None => 0,
            Some(p) => p.checked_add(1)?,
        };
        if next >= self.len {
            return None;
        }
        self.position = Some(next);
        self.position
    }

    /// Move one step backward; `None` at the start
    pub fn step_backward(&mut self) -> Option<u64> {
        self.direction = Direction::Backward;
        let prev = self.position?.checked_sub(1)?;
        self.position = Some(prev);
        self.position
    }

    /// Jump to `position`; returns false and stays put when out of range
    pub fn seek(&mut self, position: u64) -> bool {
        if position >= self.len {
            return false;
        }
        self.direction = if self.position.is_some_and(|p| position < p) {
            Direction::Backward
        } else {
            Direction::Forward
        };
        self.position = Some(position);
        true
    }

    /// Current position; `None` before the first step
    #[must_use]
    pub const fn pos(&self) -> Option<u64> {
        self.position
    }

    /// Number of events the cursor ranges over
    #[must_use]
    pub const fn len(&self) -> u64 {
        self.len
    }

    /// Whether there is nothing to navigate
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Extend the range, for traces that grow while being read
    pub fn grow(&mut self, len: u64) {
        self.len = self.len.max(len);
    }

    /// Back to before the first event
    pub fn reset(&mut self) {
        self.position = None;
        self.direction = Direction::Forward;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cursor_new() {
        let cursor = Cursor::new(3);
        assert_eq!(cursor.pos(), None);
        assert_eq!(cursor.len(), 3);
    }

    #[test]
    fn test_cursor_step_forward_to_end() {
        let mut cursor = Cursor::new(2);
        assert_eq!(cursor.step_forward(), Some(0));
        assert_eq!(cursor.step_forward(), Some(1));
        assert_eq!(cursor.step_forward(), None);
        assert_eq!(cursor.pos(), Some(1));
    }

    #[test]
    fn test_cursor_step_backward_at_start() {
        let mut cursor = Cursor::at(1, 5);
        assert_eq!(cursor.step_backward(), Some(0));
        assert_eq!(cursor.step_backward(), None);
        assert_eq!(cursor.direction, Direction::Backward);
    }

    #[test]
    fn test_cursor_empty() {
        let mut cursor = Cursor::new(0);
        assert!(cursor.is_empty());
        assert_eq!(cursor.step_forward(), None);
        assert_eq!(cursor.step_backward(), None);
    }

    #[test]
    fn test_cursor_seek() {
        let mut cursor = Cursor::new(100);
        assert!(cursor.seek(42));
        assert_eq!(cursor.pos(), Some(42));
        assert!(!cursor.seek(100));
        assert_eq!(cursor.pos(), Some(42));
        assert!(cursor.seek(10));
        assert_eq!(cursor.direction, Direction::Backward);
    }

    #[test]
    fn test_cursor_grow_and_reset() {
        let mut cursor = Cursor::at(0, 1);
        assert_eq!(cursor.step_forward(), None);
        cursor.grow(2);
        assert_eq!(cursor.step_forward(), Some(1));
        cursor.reset();
        assert_eq!(cursor.pos(), None);
    }
}
