//! The incremental fuzzy-path scorer.
//!
//! A matcher is compiled once per query and then advanced along a path one
//! component at a time. It holds one scoring state per query character, so a
//! clone-and-advance down a directory tree never re-scores ancestors:
//! sibling subtrees reuse the parent's state.
//!
//! Scoring follows the VS Code fuzzy-scorer family: exact-case matches score
//! double, runs of consecutive matches compound, and characters that start a
//! path, a component or a word earn positional bonuses.

use std::sync::Arc;

use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
#[error("query must be non-empty printable ASCII")]
pub struct InvalidQuery;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct QueryChar {
    /// Position in the query this entry advances.
    index: usize,
    /// 2 for an exact-case match, 1 for a lower-cased match.
    boost: u32,
}

#[derive(Debug, Clone, Copy, Default, PartialEq)]
struct State {
    score: u32,
    consecutive: u32,
    epoch: i32,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Matcher {
    /// Lookup by target byte; entries are in reverse index order so one pass
    /// over a tick's transitions never reads state it just wrote.
    query: Arc<Vec<Vec<QueryChar>>>,
    states: Vec<State>,
    target: Vec<u8>,
    epoch: i32,
}

impl Matcher {
    pub fn new(query: &str) -> Result<Matcher, InvalidQuery> {
        if query.is_empty() {
            return Err(InvalidQuery);
        }
        let mut lookup = vec![Vec::new(); 128];
        let bytes = query.as_bytes();
        for index in (0..bytes.len()).rev() {
            let c = bytes[index];
            if c == 0 || c > 127 {
                return Err(InvalidQuery);
            }
            let lower = c.to_ascii_lowercase();
            lookup[c as usize].push(QueryChar { index, boost: 2 });
            if lower != c {
                lookup[lower as usize].push(QueryChar { index, boost: 1 });
            }
        }
        Ok(Matcher {
            query: Arc::new(lookup),
            states: vec![State::default(); bytes.len()],
            target: Vec::new(),
            epoch: 0,
        })
    }

    /// Commits `component` onto the accumulated target and returns the
    /// advanced matcher. `self` is untouched, so sibling subtrees can keep
    /// advancing from the same parent.
    pub fn advance(&self, component: &[u8]) -> Matcher {
        let (states, epoch, _) = self.run(component);
        let mut target = self.target.clone();
        target.extend_from_slice(component);
        Matcher {
            query: Arc::clone(&self.query),
            states,
            target,
            epoch,
        }
    }

    /// Scores `component` against the accumulated target without committing.
    /// Zero means no match.
    pub fn score(&self, component: &[u8]) -> u32 {
        self.run(component).2
    }

    /// The full path the accumulated target plus `component` spells out.
    pub fn target(&self, component: &[u8]) -> String {
        let mut full = self.target.clone();
        full.extend_from_slice(component);
        String::from_utf8_lossy(&full).into_owned()
    }

    fn run(&self, component: &[u8]) -> (Vec<State>, i32, u32) {
        let mut scratch = self.states.clone();
        let mut epoch = self.epoch;
        let mut prev = self.target.last().copied().unwrap_or(0);
        let mut score = 0u32;

        for &c in component {
            // Index nodes map non-ASCII bytes to the zero sentinel, which
            // never appears in the lookup; anything else out of range is
            // simply unmatched.
            if let Some(transitions) = self.query.get(c as usize) {
                for qc in transitions {
                    let curr = scratch[qc.index];

                    let mut next = State {
                        score: qc.boost,
                        consecutive: 1,
                        epoch: epoch + 1,
                    };

                    if qc.index != 0 {
                        let past = scratch[qc.index - 1];
                        if past.score == 0 {
                            continue;
                        }
                        next.score += past.score;
                        if past.epoch == epoch {
                            // +5C points for C prior consecutive characters.
                            next.score += past.consecutive * 5;
                            next.consecutive = past.consecutive + 1;
                        }
                    }

                    next.score += match prev {
                        0 => 8,
                        b'/' | b'\\' => 5,
                        b'_' | b'-' | b'.' | b' ' | b'\'' | b'"' | b':' => 4,
                        // camelCase bonus; never stacks with the separator
                        // bonuses above.
                        _ => {
                            if c.is_ascii_uppercase() {
                                2
                            } else {
                                0
                            }
                        }
                    };

                    if next.score > curr.score {
                        scratch[qc.index] = next;
                        if qc.index == scratch.len() - 1 {
                            score = next.score;
                        }
                    }
                }
            }
            prev = c;
            epoch += 1;
        }

        (scratch, epoch, score)
    }
}
