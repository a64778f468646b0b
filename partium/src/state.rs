//! One frame of conditional-compilation nesting.

use crate::token::Token;

/// The state of one `#if`/`#endif` group.
///
/// `parent_active && active` decides whether tokens flow; `processed`
/// distinguishes a branch the engine evaluated from one the control layer
/// asked it to keep, whose captured directive line is retained in `tokens`
/// for replay.
#[derive(Clone, Debug)]
pub(crate) struct State {
    pub parent_active: bool,
    pub active: bool,
    pub saw_else: bool,
    pub processed: bool,
    pub tokens: Vec<Token>,
}

impl State {
    /// The sentinel bottom frame; never popped.
    pub fn sentinel() -> Self {
        State {
            parent_active: true,
            active: true,
            saw_else: false,
            processed: true,
            tokens: Vec::new(),
        }
    }

    /// A frame nested inside `parent`, capturing its directive line.
    pub fn nested(parent: &State, tokens: Vec<Token>) -> Self {
        State {
            parent_active: parent.parent_active && parent.active,
            active: true,
            saw_else: false,
            processed: true,
            tokens,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nesting_propagates_activity() {
        let top = State::sentinel();
        let mut mid = State::nested(&top, Vec::new());
        mid.active = false;
        let inner = State::nested(&mid, Vec::new());
        assert!(!inner.parent_active);
        // A frame under an inactive parent stays inactive regardless of its
        // own flag.
        assert!(!(inner.parent_active && inner.active) || !inner.active);
    }
}
