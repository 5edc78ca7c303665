//! Pattern-based entity and relation extraction.
//!
//! A deliberately simple heuristic enrichment layer: entities are repeated
//! multi-word capitalized phrases, relations are sentence-level
//! co-occurrence edges with a fixed confidence. Nothing here blocks
//! ingestion — no matches just means empty output.

use std::collections::{HashMap, HashSet};

use serde::Serialize;

/// Confidence assigned to every co-occurrence edge. Not learned.
pub const RELATION_CONFIDENCE: f32 = 0.3;

/// Longest candidate phrase, in tokens.
const MAX_PHRASE_TOKENS: usize = 4;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Entity {
    pub name: String,
    pub mention_count: usize,
    pub entity_type: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Relation {
    pub source: String,
    pub target: String,
    pub relation_type: String,
    pub confidence: f32,
}

/// Extract candidate entities: runs of 2–4 consecutive capitalized tokens,
/// retained only when the phrase appears more than once (single mentions
/// are discarded as noise).
pub fn extract_entities(text: &str) -> Vec<Entity> {
    let tokens: Vec<&str> = text.split_whitespace().collect();

    let mut counts: HashMap<String, usize> = HashMap::new();
    let mut order: Vec<String> = Vec::new();

    let mut i = 0;
    while i < tokens.len() {
        if !is_capitalized(tokens[i]) {
            i += 1;
            continue;
        }
        let mut j = i + 1;
        // Trailing punctuation ("Inc.," or a sentence-initial "Later,")
        // terminates the run; the phrase never spans it.
        while j < tokens.len()
            && j - i < MAX_PHRASE_TOKENS
            && ends_clean(tokens[j - 1])
            && is_capitalized(tokens[j])
        {
            j += 1;
        }
        if j - i >= 2 {
            let phrase = tokens[i..j]
                .iter()
                .map(|t| clean_token(t))
                .collect::<Vec<_>>()
                .join(" ");
            let count = counts.entry(phrase.clone()).or_insert(0);
            if *count == 0 {
                order.push(phrase);
            }
            *count += 1;
        }
        i = j.max(i + 1);
    }

    order
        .into_iter()
        .filter_map(|name| {
            let mentions = counts[&name];
            (mentions > 1).then(|| Entity {
                name,
                mention_count: mentions,
                entity_type: "unclassified".to_string(),
            })
        })
        .collect()
}

/// Build co-occurrence relations: sentences split on `.`, `!`, `?`; every
/// unordered pair of entities sharing a sentence yields exactly one edge.
pub fn extract_relations(text: &str, entities: &[Entity]) -> Vec<Relation> {
    if entities.len() < 2 {
        return Vec::new();
    }

    let mut seen: HashSet<(usize, usize)> = HashSet::new();
    let mut relations = Vec::new();

    for sentence in text.split(['.', '!', '?']) {
        let present: Vec<usize> = entities
            .iter()
            .enumerate()
            .filter(|(_, e)| sentence.contains(&e.name))
            .map(|(i, _)| i)
            .collect();

        for a in 0..present.len() {
            for b in (a + 1)..present.len() {
                let pair = (present[a], present[b]);
                if seen.insert(pair) {
                    relations.push(Relation {
                        source: entities[pair.0].name.clone(),
                        target: entities[pair.1].name.clone(),
                        relation_type: "co-occurrence".to_string(),
                        confidence: RELATION_CONFIDENCE,
                    });
                }
            }
        }
    }

    relations
}

fn is_capitalized(token: &str) -> bool {
    let cleaned = clean_token(token);
    let mut chars = cleaned.chars();
    match chars.next() {
        Some(first) => first.is_uppercase() && chars.all(|c| c.is_alphanumeric() || c == '\''),
        None => false,
    }
}

fn ends_clean(token: &str) -> bool {
    token.chars().last().is_some_and(|c| c.is_alphanumeric())
}

fn clean_token(token: &str) -> &str {
    token.trim_matches(|c: char| !c.is_alphanumeric())
}
