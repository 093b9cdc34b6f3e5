use std::fmt;

/// Per-instance fencing progress.
///
/// ```text
/// Unfenced --(declared)--> FencingRequested --(confirmed)--> Fenced
///     ^                                                        |
///     +---(confirmed)-- UnfencingRequested <--(not declared)---+
/// ```
///
/// A request whose declaration is withdrawn before it is confirmed reverses
/// direction (`FencingRequested` <-> `UnfencingRequested`) rather than running
/// to completion first.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash)]
pub enum FencingState {
    #[default]
    Unfenced,
    FencingRequested,
    Fenced,
    UnfencingRequested,
}

/// A side effect the reconciler asks the executor to perform.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum Action {
    Fence,
    Unfence,
}

// === impl FencingState ===

impl FencingState {
    /// True while the instance must not accept connections or change roles.
    pub fn is_fencing(self) -> bool {
        matches!(self, Self::FencingRequested | Self::Fenced)
    }

    pub fn is_in_progress(self) -> bool {
        matches!(self, Self::FencingRequested | Self::UnfencingRequested)
    }

    /// True when the state satisfies the declaration.
    pub fn is_converged(self, declared: bool) -> bool {
        if declared {
            self == Self::Fenced
        } else {
            self == Self::Unfenced
        }
    }

    /// Returns the state an instance moves to given whether it is declared
    /// fenced, along with the action needed to get there, if any.
    ///
    /// In-progress states yield their action again so that failed attempts are
    /// retried.
    pub fn step(self, declared: bool) -> (Self, Option<Action>) {
        match (self, declared) {
            (Self::Unfenced, false) => (Self::Unfenced, None),
            (Self::Fenced, true) => (Self::Fenced, None),
            (Self::Unfenced | Self::FencingRequested | Self::UnfencingRequested, true) => {
                (Self::FencingRequested, Some(Action::Fence))
            }
            (Self::Fenced | Self::UnfencingRequested | Self::FencingRequested, false) => {
                (Self::UnfencingRequested, Some(Action::Unfence))
            }
        }
    }

    /// Applies the executor's confirmation of `action`. Confirmations that no
    /// longer match the pending request are stale and leave the state as is.
    pub fn confirm(self, action: Action) -> Self {
        match (self, action) {
            (Self::FencingRequested, Action::Fence) => Self::Fenced,
            (Self::UnfencingRequested, Action::Unfence) => Self::Unfenced,
            (state, _) => state,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Unfenced => "Unfenced",
            Self::FencingRequested => "FencingRequested",
            Self::Fenced => "Fenced",
            Self::UnfencingRequested => "UnfencingRequested",
        }
    }
}

impl fmt::Display for FencingState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// === impl Action ===

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Fence => f.write_str("fence"),
            Self::Unfence => f.write_str("unfence"),
        }
    }
}
