//! Per publisher/chain duplicate detection over gap intervals.

use starling_api::MessageRef;

/// Default bound on tracked gaps per detector.
pub const DEFAULT_MAX_GAP_COUNT: usize = 10_000;

/// The detector was fed numbers it cannot reconcile with what it has seen.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DetectorError {
    /// The previous reference is not strictly before the message number.
    /// A publisher bug; the message carries no usable ordering information.
    #[error("invalid numbering: previous {previous} >= current {current}")]
    InvalidNumbering {
        /// The offending previous reference.
        previous: MessageRef,
        /// The message's own number.
        current: MessageRef,
    },

    /// The `(previous, current]` span straddles a gap boundary or covers
    /// more than one gap: the message's prev-ref chain conflicts with
    /// messages already seen.
    #[error("gap mismatch: ({previous}, {current}] straddles gap ({lower}, {upper}]")]
    GapMismatch {
        /// The offending previous reference.
        previous: MessageRef,
        /// The message's own number.
        current: MessageRef,
        /// Lower bound of the gap the span collided with.
        lower: MessageRef,
        /// Upper bound of that gap, rendered as `Infinity|Infinity` when
        /// open-ended.
        upper: String,
    },
}

/// A half-open interval `(lower, upper]` of not-yet-seen chain positions.
/// `upper == None` means the interval is open-ended.
#[derive(Debug, Clone, PartialEq, Eq)]
struct Gap {
    lower: MessageRef,
    upper: Option<MessageRef>,
}

impl Gap {
    fn upper_to_string(&self) -> String {
        match self.upper {
            Some(u) => u.to_string(),
            None => "Infinity|Infinity".to_string(),
        }
    }
}

impl std::fmt::Display for Gap {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "({}, {}]", self.lower, self.upper_to_string())
    }
}

/// Tracks which chain positions of one publisher/chain have been seen,
/// answering "is this message new" under arbitrary arrival order.
///
/// State is an ascending, non-overlapping list of gaps; the last gap is
/// always open-ended. Anything not inside a gap has been seen. The list is
/// bounded: once it exceeds the configured gap count, the lowest (oldest)
/// gaps are dropped, trading memory for the chance of re-admitting a very
/// old replay.
#[derive(Debug)]
pub struct DuplicateMessageDetector {
    max_gap_count: usize,
    gaps: Vec<Gap>,
}

impl Default for DuplicateMessageDetector {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_GAP_COUNT)
    }
}

impl DuplicateMessageDetector {
    /// Construct a detector bounded to `max_gap_count` gaps.
    pub fn new(max_gap_count: usize) -> Self {
        Self {
            max_gap_count,
            gaps: Vec::new(),
        }
    }

    /// Record a message's chain position and report whether it was unseen.
    ///
    /// `previous` is the message's declared predecessor; without one only
    /// the open-ended tail gap is consulted.
    pub fn mark_and_check(
        &mut self,
        previous: Option<MessageRef>,
        current: MessageRef,
    ) -> Result<bool, DetectorError> {
        if let Some(previous) = previous {
            if previous >= current {
                return Err(DetectorError::InvalidNumbering { previous, current });
            }
        }

        if self.gaps.is_empty() {
            self.gaps.push(Gap {
                lower: current,
                upper: None,
            });
            return Ok(true);
        }

        let Some(previous) = previous else {
            // No predecessor declared: minimal check against the newest
            // known position only.
            let last = self.gaps.last_mut().expect("gap list is non-empty");
            if current > last.lower {
                last.lower = current;
                return Ok(true);
            }
            return Ok(false);
        };

        for i in (0..self.gaps.len()).rev() {
            let gap = self.gaps[i].clone();

            // Above the gap entirely: the span sits in seen territory
            // between this gap and the one above it.
            if gap.upper.is_some_and(|u| previous >= u) {
                return Ok(false);
            }

            if previous >= gap.lower {
                // previous falls on or inside the gap's span
                let inside = match gap.upper {
                    Some(u) => current <= u,
                    None => true,
                };
                if !inside {
                    return Err(DetectorError::GapMismatch {
                        previous,
                        current,
                        lower: gap.lower,
                        upper: gap.upper_to_string(),
                    });
                }
                self.fill(i, previous, current);
                self.evict();
                return Ok(true);
            }

            if current > gap.lower {
                // current reaches into the gap while previous sits below it
                return Err(DetectorError::GapMismatch {
                    previous,
                    current,
                    lower: gap.lower,
                    upper: gap.upper_to_string(),
                });
            }
        }

        // Below every gap: fully seen.
        Ok(false)
    }

    /// Carve `(previous, current]` out of the gap at `index`.
    fn fill(&mut self, index: usize, previous: MessageRef, current: MessageRef) {
        let gap = self.gaps[index].clone();
        let touches_lower = previous == gap.lower;
        let touches_upper = gap.upper == Some(current);
        match (touches_lower, touches_upper) {
            (true, true) => {
                self.gaps.remove(index);
            }
            (true, false) => {
                self.gaps[index].lower = current;
            }
            (false, true) => {
                self.gaps[index].upper = Some(previous);
            }
            (false, false) => {
                self.gaps[index].upper = Some(previous);
                self.gaps.insert(
                    index + 1,
                    Gap {
                        lower: current,
                        upper: gap.upper,
                    },
                );
            }
        }
    }

    /// Drop the lowest gaps once past the configured bound; the oldest
    /// history is presumed fully resolved.
    fn evict(&mut self) {
        while self.gaps.len() > self.max_gap_count {
            self.gaps.remove(0);
        }
    }

    #[cfg(test)]
    fn gap_bounds(&self) -> Vec<(MessageRef, Option<MessageRef>)> {
        self.gaps.iter().map(|g| (g.lower, g.upper)).collect()
    }
}

impl std::fmt::Display for DuplicateMessageDetector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut first = true;
        for gap in &self.gaps {
            if !first {
                f.write_str(", ")?;
            }
            first = false;
            write!(f, "{gap}")?;
        }
        Ok(())
    }
}
