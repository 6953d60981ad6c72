//! Conservative compilation of a regular expression into a trigram query.
//!
//! The query is an over-approximation: every file matched by the regex is
//! guaranteed to be in the posting-query result, but the result may contain
//! files the regex does not match. Constructs that pin down no literal bytes
//! (character classes, anchors, bounded repetition of short literals,
//! case-insensitive text) widen the query, in the worst case to [`Query::All`].

use std::collections::BTreeSet;

use regex_syntax::hir::{Hir, HirKind};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Query {
    /// Every file is a candidate.
    All,
    /// No file can match.
    None,
    /// All of these trigrams must appear (substrings of one required literal).
    Trigrams(BTreeSet<[u8; 3]>),
    And(Vec<Query>),
    Or(Vec<Query>),
}

/// Compiles a pattern with default syntax into a trigram query. Callers that
/// apply regex flags should parse the HIR themselves and use [`from_hir`].
pub fn compile(pattern: &str) -> Result<Query, Box<regex_syntax::Error>> {
    let hir = regex_syntax::ParserBuilder::new()
        .multi_line(true)
        .build()
        .parse(pattern)
        .map_err(Box::new)?;
    Ok(from_hir(&hir))
}

pub fn from_hir(hir: &Hir) -> Query {
    match hir.kind() {
        HirKind::Literal(lit) => literal_query(&lit.0),
        HirKind::Concat(subs) => {
            let mut parts = Vec::new();
            for sub in subs {
                match from_hir(sub) {
                    Query::All => continue,
                    Query::None => return Query::None,
                    q => parts.push(q),
                }
            }
            match parts.len() {
                0 => Query::All,
                1 => parts.into_iter().next().unwrap_or(Query::All),
                _ => Query::And(parts),
            }
        }
        HirKind::Alternation(subs) => {
            let mut parts = Vec::new();
            for sub in subs {
                match from_hir(sub) {
                    // One branch with no required trigrams widens the whole
                    // alternation.
                    Query::All => return Query::All,
                    Query::None => continue,
                    q => parts.push(q),
                }
            }
            match parts.len() {
                0 => Query::None,
                1 => parts.into_iter().next().unwrap_or(Query::None),
                _ => Query::Or(parts),
            }
        }
        HirKind::Repetition(rep) => {
            if rep.min >= 1 {
                from_hir(&rep.sub)
            } else {
                Query::All
            }
        }
        HirKind::Capture(cap) => from_hir(&cap.sub),
        HirKind::Empty | HirKind::Class(_) | HirKind::Look(_) => Query::All,
    }
}

fn literal_query(bytes: &[u8]) -> Query {
    if bytes.len() < 3 {
        return Query::All;
    }
    let mut trigrams = BTreeSet::new();
    for window in bytes.windows(3) {
        trigrams.insert([window[0], window[1], window[2]]);
    }
    Query::Trigrams(trigrams)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn trigrams(parts: &[&str]) -> Query {
        Query::Trigrams(
            parts
                .iter()
                .map(|p| {
                    let b = p.as_bytes();
                    [b[0], b[1], b[2]]
                })
                .collect(),
        )
    }

    #[test]
    fn plain_literal_yields_its_trigrams() {
        assert_eq!(trigrams(&["abc"]), compile("abc").unwrap());
        assert_eq!(
            trigrams(&["abc", "bcd"]),
            compile("abcd").unwrap(),
            "sliding window over the literal"
        );
    }

    #[test]
    fn short_literal_is_unrestricted() {
        assert_eq!(Query::All, compile("ab").unwrap());
    }

    #[test]
    fn concat_requires_every_long_literal() {
        let query = compile("foo1.+bar2").unwrap();
        assert_eq!(
            Query::And(vec![trigrams(&["foo", "oo1"]), trigrams(&["bar", "ar2"])]),
            query
        );
    }

    #[test]
    fn alternation_widens_on_weak_branch() {
        assert_eq!(Query::All, compile("foobar|x").unwrap());
        assert_eq!(
            Query::Or(vec![trigrams(&["foo"]), trigrams(&["bar"])]),
            compile("foo|bar").unwrap()
        );
    }

    #[test]
    fn star_repetition_is_unrestricted_plus_is_not() {
        assert_eq!(Query::All, compile("(abc)*").unwrap());
        assert_eq!(trigrams(&["abc"]), compile("(abc)+").unwrap());
    }

    #[test]
    fn anchors_do_not_constrain() {
        assert_eq!(trigrams(&["foo"]), compile("^foo$").unwrap());
    }
}
