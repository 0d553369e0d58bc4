use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::outline::OutlineNode;
use crate::text::{contains_word, normalize};

pub const DEFAULT_FACT_CAP: usize = 30;
/// Facts filed under this key are relevant to every chapter.
pub const SETTING_KEY: &str = "setting";

/// Per-word spelling similarity above which two differing words still agree.
const JARO_WINKLER_COMPATIBLE: f64 = 0.92;
/// Shortest word that may differ by spelling alone.
const MIN_FUZZY_WORD_CHARS: usize = 5;
const NEGATIONS: [&str; 5] = ["not", "no", "never", "without", "isn"];
const NEGATING_PREFIXES: [&str; 8] = ["un", "non", "in", "im", "ir", "il", "dis", "out"];
const FILLER_WORDS: [&str; 3] = ["a", "an", "the"];
const SYNONYMS: [(&str, &str); 7] = [
    ("gray", "grey"),
    ("blonde", "blond"),
    ("flaxen", "blond"),
    ("deceased", "dead"),
    ("colour", "color"),
    ("eyes", "eye"),
    ("wed", "married"),
];

/// A fact as reported by extraction, before it is placed in the story.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObservedFact {
    pub key: String,
    pub attribute: String,
    pub value: String,
}

impl ObservedFact {
    pub fn new(key: impl Into<String>, attribute: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            attribute: attribute.into(),
            value: value.into(),
        }
    }

    fn is_complete(&self) -> bool {
        !self.key.trim().is_empty() && !self.attribute.trim().is_empty() && !self.value.trim().is_empty()
    }

    fn established_at(&self, index: usize) -> ConsistencyFact {
        ConsistencyFact {
            key: self.key.trim().to_string(),
            attribute: self.attribute.trim().to_string(),
            value: self.value.trim().to_string(),
            established_at: index,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct ConsistencyFact {
    pub key: String,
    pub attribute: String,
    pub value: String,
    pub established_at: usize,
}

/// An incoming fact that contradicts the canonical (earliest) one.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct FactConflict {
    pub existing: ConsistencyFact,
    pub incoming: ConsistencyFact,
}

impl fmt::Display for FactConflict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {}: `{}` (chapter {}) contradicts `{}` (chapter {})",
            self.existing.key,
            self.existing.attribute,
            self.incoming.value,
            self.incoming.established_at + 1,
            self.existing.value,
            self.existing.established_at + 1
        )
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("{} fact(s) contradict established canon", .conflicts.len())]
pub struct ConsistencyConflict {
    pub conflicts: Vec<FactConflict>,
}

#[derive(Clone, Debug)]
struct StoredFact {
    fact: ConsistencyFact,
    sequence: u64,
}

/// Canonical registry of story facts, keyed by normalized entity name.
/// Facts are append-only and the earliest value for a `(key, attribute)`
/// pair is canonical.
#[derive(Clone, Debug)]
pub struct ConsistencyTracker {
    facts: BTreeMap<String, Vec<StoredFact>>,
    flagged: Vec<FactConflict>,
    fact_cap: usize,
    next_sequence: u64,
}

impl Default for ConsistencyTracker {
    fn default() -> Self {
        Self::new(DEFAULT_FACT_CAP)
    }
}

struct Evaluation {
    accepted: Vec<ConsistencyFact>,
    conflicts: Vec<FactConflict>,
}

impl ConsistencyTracker {
    pub fn new(fact_cap: usize) -> Self {
        Self {
            facts: BTreeMap::new(),
            flagged: Vec::new(),
            fact_cap: fact_cap.max(1),
            next_sequence: 0,
        }
    }

    pub fn fact_cap(&self) -> usize {
        self.fact_cap
    }

    pub fn len(&self) -> usize {
        self.facts.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.facts.is_empty()
    }

    /// All facts about `key`, oldest first.
    pub fn facts_about(&self, key: &str) -> Vec<&ConsistencyFact> {
        self.facts
            .get(&key_of(key))
            .map(|stored| stored.iter().map(|s| &s.fact).collect())
            .unwrap_or_default()
    }

    /// Conflicts rejected by earlier `record` calls.
    pub fn flagged_conflicts(&self) -> &[FactConflict] {
        &self.flagged
    }

    /// Conflicts `facts` would raise if recorded at `index`. Does not mutate.
    pub fn check(&self, index: usize, facts: &[ObservedFact]) -> Vec<FactConflict> {
        self.evaluate(index, facts).conflicts
    }

    /// Stores every fact that agrees with canon and returns how many were
    /// new. Contradicting facts are not stored; they are kept as flagged
    /// conflicts and reported through the error, after the compatible
    /// facts of the same batch have been stored.
    pub fn record(&mut self, index: usize, facts: Vec<ObservedFact>) -> Result<usize, ConsistencyConflict> {
        let Evaluation { accepted, conflicts } = self.evaluate(index, &facts);
        let stored = accepted.len();
        for fact in accepted {
            let sequence = self.next_sequence;
            self.next_sequence += 1;
            self.facts
                .entry(key_of(&fact.key))
                .or_default()
                .push(StoredFact { fact, sequence });
        }

        if conflicts.is_empty() {
            Ok(stored)
        } else {
            self.flagged.extend(conflicts.iter().cloned());
            Err(ConsistencyConflict { conflicts })
        }
    }

    /// Bounded set of facts to show the model before drafting `node`.
    ///
    /// Only facts established strictly before `node.index` qualify. Keys
    /// mentioned in the node's title, summary or goals are relevant, plus the
    /// setting; when no key is mentioned every key qualifies. Above the cap
    /// the most recently established facts win.
    pub fn context_for(&self, node: &OutlineNode) -> Vec<ConsistencyFact> {
        let mut haystack = format!("{}\n{}", node.title, node.summary);
        for goal in &node.goals {
            haystack.push('\n');
            haystack.push_str(goal);
        }

        let past = |stored: &&StoredFact| stored.fact.established_at < node.index;
        let mentioned: Vec<&String> = self
            .facts
            .iter()
            .filter(|(key, stored)| {
                key.as_str() != SETTING_KEY && stored.iter().any(|s| past(&s)) && key_mentioned(&haystack, key)
            })
            .map(|(key, _)| key)
            .collect();

        let mut candidates: Vec<&StoredFact> = self
            .facts
            .iter()
            .filter(|(key, _)| mentioned.is_empty() || key.as_str() == SETTING_KEY || mentioned.contains(key))
            .flat_map(|(_, stored)| stored.iter())
            .filter(past)
            .collect();

        candidates.sort_by(|a, b| {
            b.fact
                .established_at
                .cmp(&a.fact.established_at)
                .then(b.sequence.cmp(&a.sequence))
        });
        candidates
            .into_iter()
            .take(self.fact_cap)
            .map(|stored| stored.fact.clone())
            .collect()
    }

    fn evaluate(&self, index: usize, facts: &[ObservedFact]) -> Evaluation {
        let mut accepted: Vec<ConsistencyFact> = Vec::new();
        let mut conflicts = Vec::new();

        for observed in facts.iter().filter(|fact| fact.is_complete()) {
            let incoming = observed.established_at(index);
            let key = key_of(&incoming.key);
            let attribute = key_of(&incoming.attribute);

            let canonical = self
                .facts
                .get(&key)
                .into_iter()
                .flatten()
                .map(|stored| &stored.fact)
                .chain(accepted.iter())
                .find(|fact| key_of(&fact.key) == key && key_of(&fact.attribute) == attribute);

            match canonical {
                None => accepted.push(incoming),
                Some(existing) if values_compatible(&existing.value, &incoming.value) => {}
                Some(existing) => conflicts.push(FactConflict {
                    existing: existing.clone(),
                    incoming,
                }),
            }
        }

        Evaluation { accepted, conflicts }
    }
}

fn key_of(text: &str) -> String {
    canonical_tokens(text).join(" ")
}

fn canonical_tokens(text: &str) -> Vec<String> {
    normalize(text)
        .split_whitespace()
        .map(|token| {
            SYNONYMS
                .iter()
                .find(|(word, _)| *word == token)
                .map_or(token, |(_, canonical)| canonical)
                .to_string()
        })
        .collect()
}

/// A key counts as mentioned when the full key, or any of its words of four
/// or more letters, appears as a whole word.
fn key_mentioned(haystack: &str, key: &str) -> bool {
    contains_word(haystack, key)
        || key
            .split_whitespace()
            .filter(|word| word.chars().count() >= 4)
            .any(|word| contains_word(haystack, word))
}

fn is_negated(tokens: &[String]) -> bool {
    tokens.iter().any(|token| NEGATIONS.contains(&token.as_str()))
}

/// Heuristic equivalence of two values for the same attribute.
///
/// Values agree when they are equal after normalization and synonym folding,
/// or when one is contained in the other word for word. Otherwise they must
/// have the same words in the same places, where a differing pair is only
/// accepted as a misspelling of a longer alphabetic word. A differing number,
/// a negating prefix such as `un` or `in`/`out`, or a negation on only one
/// side is never compatible.
pub fn values_compatible(left: &str, right: &str) -> bool {
    let left_tokens = value_tokens(left);
    let right_tokens = value_tokens(right);
    if is_negated(&left_tokens) != is_negated(&right_tokens) {
        return false;
    }
    if left_tokens.is_empty() || right_tokens.is_empty() || left_tokens == right_tokens {
        return true;
    }

    let left = left_tokens.join(" ");
    let right = right_tokens.join(" ");
    if contains_word(&left, &right) || contains_word(&right, &left) {
        return true;
    }

    left_tokens.len() == right_tokens.len()
        && left_tokens
            .iter()
            .zip(&right_tokens)
            .all(|(left, right)| words_compatible(left, right))
}

fn value_tokens(text: &str) -> Vec<String> {
    canonical_tokens(text)
        .into_iter()
        .filter(|token| !FILLER_WORDS.contains(&token.as_str()))
        .collect()
}

fn words_compatible(left: &str, right: &str) -> bool {
    if left == right {
        return true;
    }
    let is_fuzzy_candidate = |word: &str| {
        word.chars().count() >= MIN_FUZZY_WORD_CHARS && word.chars().all(char::is_alphabetic)
    };
    if !is_fuzzy_candidate(left) || !is_fuzzy_candidate(right) || negated_by_prefix(left, right) {
        return false;
    }
    strsim::jaro_winkler(left, right) >= JARO_WINKLER_COMPATIBLE
}

/// `married`/`unmarried` and `inside`/`outside`: the words differ only in a
/// negating or opposing prefix.
fn negated_by_prefix(left: &str, right: &str) -> bool {
    let stem = |word: &str| -> Vec<String> {
        std::iter::once(word.to_string())
            .chain(
                NEGATING_PREFIXES
                    .iter()
                    .filter_map(|prefix| word.strip_prefix(prefix))
                    .filter(|rest| !rest.is_empty())
                    .map(str::to_string),
            )
            .collect()
    };
    let left_stems = stem(left);
    stem(right).iter().any(|candidate| left_stems.contains(candidate))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(index: usize, summary: &str, goals: &[&str]) -> OutlineNode {
        OutlineNode {
            index,
            title: format!("Chapter {}", index + 1),
            summary: summary.to_string(),
            goals: goals.iter().map(|goal| goal.to_string()).collect(),
            target_length: 1000,
        }
    }

    #[test]
    fn contradiction_of_an_established_pair_is_rejected() {
        let mut tracker = ConsistencyTracker::default();
        tracker
            .record(2, vec![ObservedFact::new("Odile", "eye colour", "green")])
            .unwrap();

        let err = tracker
            .record(5, vec![ObservedFact::new("Odile", "eye colour", "brown")])
            .unwrap_err();

        assert_eq!(err.conflicts.len(), 1);
        let conflict = &err.conflicts[0];
        assert_eq!(conflict.existing.value, "green");
        assert_eq!(conflict.existing.established_at, 2);
        assert_eq!(conflict.incoming.value, "brown");
        assert_eq!(tracker.flagged_conflicts().len(), 1);
        // earliest fact stays canonical
        assert_eq!(tracker.facts_about("odile").len(), 1);
        assert_eq!(tracker.facts_about("odile")[0].value, "green");
    }

    #[test]
    fn other_attributes_never_conflict() {
        let mut tracker = ConsistencyTracker::default();
        tracker
            .record(2, vec![ObservedFact::new("Odile", "eye colour", "green")])
            .unwrap();

        let stored = tracker
            .record(
                5,
                vec![
                    ObservedFact::new("Odile", "occupation", "seamstress"),
                    ObservedFact::new("Odile", "hair", "black"),
                ],
            )
            .unwrap();
        assert_eq!(stored, 2);
        assert_eq!(tracker.len(), 3);
    }

    #[test]
    fn compatible_values_are_not_conflicts() {
        assert!(values_compatible("grey", "Gray"));
        assert!(values_compatible("blonde", "blond"));
        assert!(values_compatible("brown", "dark brown"));
        assert!(values_compatible("Marie Duval", "Marie  Duval."));
        assert!(!values_compatible("alive", "not alive"));
        assert!(!values_compatible("green", "brown"));

        let mut tracker = ConsistencyTracker::default();
        tracker
            .record(0, vec![ObservedFact::new("Lucien", "eye color", "grey")])
            .unwrap();
        assert!(tracker
            .check(3, &[ObservedFact::new("lucien", "eye colour", "gray")])
            .is_empty());
    }

    #[test]
    fn contradicting_values_are_never_compatible() {
        let contradictions = [
            ("locked from the inside", "locked from the outside"),
            ("born in 1852", "born in 1853"),
            ("Rue de Rivoli 12", "Rue de Rivoli 14"),
            ("married", "unmarried"),
            ("killed with a knife", "killed with a rifle"),
            ("black", "block"),
            ("aged 40", "aged 41"),
        ];
        for (left, right) in contradictions {
            assert!(!values_compatible(left, right), "{left:?} vs {right:?}");
            assert!(!values_compatible(right, left), "{right:?} vs {left:?}");
        }
    }

    #[test]
    fn synonyms_and_misspellings_stay_compatible() {
        let agreements = [
            ("grey", "gray"),
            ("flaxen", "blond"),
            ("dead", "deceased"),
            ("married", "wed"),
            ("Lucien Marchand", "Lucien Marchand."),
            ("Inspector Marchand", "inspector Marchant"),
            ("locked from the inside", "locked from inside"),
            ("killed with a knife", "killed"),
        ];
        for (left, right) in agreements {
            assert!(values_compatible(left, right), "{left:?} vs {right:?}");
            assert!(values_compatible(right, left), "{right:?} vs {left:?}");
        }
    }

    #[test]
    fn opposite_door_lock_is_flagged_across_chapters() {
        let mut tracker = ConsistencyTracker::default();
        tracker
            .record(2, vec![ObservedFact::new("Salon", "door", "locked from the inside")])
            .unwrap();

        let err = tracker
            .record(5, vec![ObservedFact::new("Salon", "door", "locked from the outside")])
            .unwrap_err();

        assert_eq!(err.conflicts.len(), 1);
        assert_eq!(err.conflicts[0].existing.value, "locked from the inside");
        assert_eq!(tracker.facts_about("salon").len(), 1);
    }

    #[test]
    fn check_does_not_mutate() {
        let mut tracker = ConsistencyTracker::default();
        tracker
            .record(0, vec![ObservedFact::new("Lucien", "rank", "inspector")])
            .unwrap();

        let conflicts = tracker.check(
            1,
            &[
                ObservedFact::new("Lucien", "rank", "constable"),
                ObservedFact::new("Lucien", "weapon", "cane"),
            ],
        );

        assert_eq!(conflicts.len(), 1);
        assert_eq!(tracker.len(), 1);
        assert!(tracker.flagged_conflicts().is_empty());
    }

    #[test]
    fn conflicts_within_one_batch_are_caught() {
        let mut tracker = ConsistencyTracker::default();
        let err = tracker
            .record(
                1,
                vec![
                    ObservedFact::new("Salon", "door", "locked from inside"),
                    ObservedFact::new("Salon", "door", "wide open"),
                ],
            )
            .unwrap_err();
        assert_eq!(err.conflicts.len(), 1);
        assert_eq!(tracker.len(), 1);
    }

    #[test]
    fn context_never_leaks_future_facts() {
        let mut tracker = ConsistencyTracker::default();
        for index in 0..5 {
            tracker
                .record(index, vec![ObservedFact::new("Lucien", format!("clue {index}"), "found")])
                .unwrap();
        }

        let context = tracker.context_for(&node(3, "Lucien returns to the salon", &[]));
        assert_eq!(context.len(), 3);
        assert!(context.iter().all(|fact| fact.established_at < 3));
        assert!(tracker.context_for(&node(0, "Lucien arrives", &[])).is_empty());
    }

    #[test]
    fn context_prefers_mentioned_keys_and_setting() {
        let mut tracker = ConsistencyTracker::default();
        tracker
            .record(
                0,
                vec![
                    ObservedFact::new("Inspector Lucien Marchand", "eyes", "grey"),
                    ObservedFact::new("Odile", "occupation", "seamstress"),
                    ObservedFact::new("setting", "season", "winter"),
                ],
            )
            .unwrap();

        let context = tracker.context_for(&node(1, "A quiet morning", &["Marchand questions the porter"]));
        let keys: Vec<&str> = context.iter().map(|fact| fact.key.as_str()).collect();
        assert!(keys.contains(&"Inspector Lucien Marchand"));
        assert!(keys.contains(&"setting"));
        assert!(!keys.contains(&"Odile"));

        // nobody mentioned: every key qualifies
        let fallback = tracker.context_for(&node(1, "Rain over the Seine", &[]));
        assert_eq!(fallback.len(), 3);
    }

    #[test]
    fn context_is_capped_keeping_the_freshest() {
        let mut tracker = ConsistencyTracker::new(4);
        for index in 0..10 {
            tracker
                .record(index, vec![ObservedFact::new("Lucien", format!("detail {index}"), "noted")])
                .unwrap();
        }

        let context = tracker.context_for(&node(10, "Lucien names the killer", &[]));
        let chapters: Vec<usize> = context.iter().map(|fact| fact.established_at).collect();
        assert_eq!(chapters, vec![9, 8, 7, 6]);
    }
}
