//! Section state machine
//!
//! Tracks the one collapsible section that may be open while a run streams.
//! A section wraps the narrative output of one non-terminal step; terminal
//! steps are never wrapped and close whatever is open before their content.

/// Closing markup of a section.
pub const SECTION_CLOSE: &str = "</details>\n\n";

/// Opening markup of a section titled with `step`.
pub fn section_open_markup(step: &str) -> String {
    format!(
        "<details style=\"color:gray;background-color: #f8f8f8;padding: 2px;border-radius: 6px;margin-top:5px;\">\n<summary>{step}...</summary>"
    )
}

/// One markup action, in the order it must be emitted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SectionAction {
    /// Close the section of `step`.
    Close {
        /// Step whose section is closed
        step: String,
    },
    /// Open a section for `step`.
    Open {
        /// Step whose section is opened
        step: String,
    },
}

impl SectionAction {
    /// Markup text for this action.
    pub fn markup(&self) -> String {
        match self {
            Self::Close { .. } => SECTION_CLOSE.to_string(),
            Self::Open { step } => section_open_markup(step),
        }
    }
}

/// Compute the actions for a step arriving while `open` is the open section.
///
/// Pure: the caller applies the result to its own state.
pub fn plan_transition(
    open: Option<&str>,
    incoming: &str,
    incoming_is_terminal: bool,
    show_sections: bool,
) -> Vec<SectionAction> {
    if !show_sections || open == Some(incoming) {
        return Vec::new();
    }

    let mut actions = Vec::with_capacity(2);
    if let Some(step) = open {
        actions.push(SectionAction::Close {
            step: step.to_string(),
        });
    }
    if !incoming_is_terminal {
        actions.push(SectionAction::Open {
            step: incoming.to_string(),
        });
    }
    actions
}

/// Open-section state of one run.
#[derive(Debug, Clone, Default)]
pub struct SectionTracker {
    show_sections: bool,
    open: Option<String>,
    opened: usize,
    closed: usize,
}

impl SectionTracker {
    /// Create a tracker with nothing open.
    pub fn new(show_sections: bool) -> Self {
        Self {
            show_sections,
            ..Default::default()
        }
    }

    /// Currently open step, if any.
    pub fn open_step(&self) -> Option<&str> {
        self.open.as_deref()
    }

    /// Apply a step arrival and return the actions to emit.
    pub fn enter(&mut self, step: &str, is_terminal: bool) -> Vec<SectionAction> {
        let actions = plan_transition(self.open.as_deref(), step, is_terminal, self.show_sections);
        for action in &actions {
            self.apply(action);
        }
        actions
    }

    /// Close the open section, if any.
    ///
    /// A close with nothing open is a no-op.
    pub fn close(&mut self) -> Option<SectionAction> {
        let step = self.open.take()?;
        self.closed += 1;
        Some(SectionAction::Close { step })
    }

    /// Number of sections opened so far.
    pub fn opened(&self) -> usize {
        self.opened
    }

    /// Number of sections closed so far.
    pub fn closed(&self) -> usize {
        self.closed
    }

    fn apply(&mut self, action: &SectionAction) {
        match action {
            SectionAction::Close { .. } => {
                self.open = None;
                self.closed += 1;
            }
            SectionAction::Open { step } => {
                self.open = Some(step.clone());
                self.opened += 1;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn open(step: &str) -> SectionAction {
        SectionAction::Open { step: step.into() }
    }

    fn close(step: &str) -> SectionAction {
        SectionAction::Close { step: step.into() }
    }

    #[test]
    fn hidden_sections_produce_no_markup() {
        assert!(plan_transition(None, "sql_generator", false, false).is_empty());
        assert!(plan_transition(Some("a"), "b", false, false).is_empty());
    }

    #[test]
    fn first_step_opens_a_section() {
        assert_eq!(plan_transition(None, "a", false, true), vec![open("a")]);
    }

    #[test]
    fn step_change_closes_then_opens() {
        assert_eq!(
            plan_transition(Some("a"), "b", false, true),
            vec![close("a"), open("b")]
        );
    }

    #[test]
    fn terminal_step_closes_but_never_opens() {
        assert_eq!(plan_transition(Some("a"), "summarize", true, true), vec![close("a")]);
        assert!(plan_transition(None, "summarize", true, true).is_empty());
    }

    #[test]
    fn repeated_step_is_a_no_op() {
        assert!(plan_transition(Some("a"), "a", false, true).is_empty());
    }

    #[test]
    fn close_with_nothing_open_is_a_no_op() {
        let mut tracker = SectionTracker::new(true);
        assert!(tracker.close().is_none());
        assert_eq!(tracker.closed(), 0);
    }

    #[test]
    fn tracker_follows_a_sequence() {
        let mut tracker = SectionTracker::new(true);
        assert_eq!(tracker.enter("a", false), vec![open("a")]);
        assert!(tracker.enter("a", false).is_empty());
        assert_eq!(tracker.enter("b", false), vec![close("a"), open("b")]);
        assert_eq!(tracker.enter("summarize", true), vec![close("b")]);
        assert_eq!(tracker.open_step(), None);
        assert_eq!(tracker.enter("a", false), vec![open("a")]);
        assert_eq!(tracker.close(), Some(close("a")));
        assert_eq!(tracker.opened(), tracker.closed());
    }

    #[test]
    fn opens_and_closes_balance_for_any_non_terminal_sequence() {
        let sequences: [&[&str]; 4] = [
            &["a"],
            &["a", "a", "b", "a", "c", "c"],
            &["x", "y", "x", "y"],
            &[],
        ];
        for seq in sequences {
            let mut tracker = SectionTracker::new(true);
            for step in seq {
                tracker.enter(step, false);
            }
            tracker.close();
            assert_eq!(tracker.opened(), tracker.closed(), "sequence {seq:?}");
        }
    }

    #[test]
    fn open_markup_contains_step_name() {
        let markup = open("sql_generator").markup();
        assert!(markup.starts_with("<details"));
        assert!(markup.contains("<summary>sql_generator...</summary>"));
        assert_eq!(close("x").markup(), SECTION_CLOSE);
    }
}
