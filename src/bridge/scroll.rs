//! Scrollback through tmux copy mode
//!
//! Scrolling up from live mode enters copy mode first. Scrolling down in live
//! mode is a no-op: there is no history below the live screen.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::tmux::{Multiplexer, MultiplexerResult};

/// Wait after entering copy mode before sending scroll keys
pub const COPY_MODE_SETTLE: Duration = Duration::from_millis(150);

/// Wait after jumping to the bottom before leaving copy mode
pub const BOTTOM_SETTLE: Duration = Duration::from_millis(200);

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ScrollDirection {
    Up,
    Down,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ScrollAmount {
    #[default]
    Line,
    Page,
    HalfPage,
    /// Several single-line steps
    Lines(u32),
}

impl ScrollAmount {
    /// Copy-mode key and how many times to send it
    pub fn keys(self, direction: ScrollDirection) -> (&'static str, u32) {
        use ScrollDirection::{Down, Up};
        match (self, direction) {
            (ScrollAmount::Line, Up) => ("Up", 1),
            (ScrollAmount::Line, Down) => ("Down", 1),
            (ScrollAmount::Page, Up) => ("PageUp", 1),
            (ScrollAmount::Page, Down) => ("PageDown", 1),
            (ScrollAmount::HalfPage, Up) => ("C-u", 1),
            (ScrollAmount::HalfPage, Down) => ("C-d", 1),
            (ScrollAmount::Lines(n), Up) => ("Up", n),
            (ScrollAmount::Lines(n), Down) => ("Down", n),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ScrollOutcome {
    /// Already in copy mode; keys sent
    Scrolled,
    /// Entered copy mode, then sent keys
    EnteredCopyMode,
    /// Down while live; nothing to reveal
    AtBottom,
}

impl ScrollOutcome {
    pub fn as_str(self) -> &'static str {
        match self {
            ScrollOutcome::Scrolled => "scrolled",
            ScrollOutcome::EnteredCopyMode => "entered_copy_mode",
            ScrollOutcome::AtBottom => "at_bottom",
        }
    }
}

/// Settle delays, shortened in tests
#[derive(Debug, Clone, Copy)]
pub struct ScrollTimings {
    pub copy_mode_settle: Duration,
    pub bottom_settle: Duration,
}

impl Default for ScrollTimings {
    fn default() -> Self {
        Self {
            copy_mode_settle: COPY_MODE_SETTLE,
            bottom_settle: BOTTOM_SETTLE,
        }
    }
}

/// Scroll a session's pane
pub async fn scroll(
    multiplexer: &dyn Multiplexer,
    name: &str,
    direction: ScrollDirection,
    amount: ScrollAmount,
    timings: ScrollTimings,
) -> MultiplexerResult<ScrollOutcome> {
    let mut outcome = ScrollOutcome::Scrolled;
    if !multiplexer.is_in_copy_mode(name).await? {
        if direction == ScrollDirection::Down {
            debug!(session = %name, "Scroll down in live mode ignored");
            return Ok(ScrollOutcome::AtBottom);
        }
        multiplexer.enter_copy_mode(name).await?;
        tokio::time::sleep(timings.copy_mode_settle).await;
        outcome = ScrollOutcome::EnteredCopyMode;
    }

    let (key, repeat) = amount.keys(direction);
    match direction {
        ScrollDirection::Up => multiplexer.scroll_up(name, key, repeat).await?,
        ScrollDirection::Down => multiplexer.scroll_down(name, key, repeat).await?,
    }
    Ok(outcome)
}

/// Jump to the bottom of history and return to live mode.
///
/// Returns `false` when the pane was already live.
pub async fn go_to_bottom(
    multiplexer: &dyn Multiplexer,
    name: &str,
    timings: ScrollTimings,
) -> MultiplexerResult<bool> {
    if !multiplexer.is_in_copy_mode(name).await? {
        return Ok(false);
    }
    multiplexer.send_keys(name, &["S-g"]).await?;
    tokio::time::sleep(timings.bottom_settle).await;
    multiplexer.exit_copy_mode(name).await?;
    debug!(session = %name, "Returned to live mode");
    Ok(true)
}

/// Enter or leave copy mode explicitly
pub async fn set_copy_mode(
    multiplexer: &dyn Multiplexer,
    name: &str,
    enabled: bool,
) -> MultiplexerResult<()> {
    let in_copy_mode = multiplexer.is_in_copy_mode(name).await?;
    match (enabled, in_copy_mode) {
        (true, false) => multiplexer.enter_copy_mode(name).await,
        (false, true) => multiplexer.exit_copy_mode(name).await,
        _ => Ok(()),
    }
}
