//! Whole-token profanity masking.

use chat_common::types::MASK;
use std::collections::HashMap;
use unicode_general_category::{get_general_category, GeneralCategory};

/// Built-in blocklist loaded by [`ContentFilter::with_default_blocklist`].
const DEFAULT_BLOCKLIST: &[&str] = &[
    "aad", "aand", "bahenchod", "behenchod", "bhenchod", "bhenchodd", "bc", "bakchod",
    "bakchodd", "bakchodi", "bevda", "bewda", "bevdey", "bewday", "bevakoof", "bevkoof",
    "bevkuf", "bewakoof", "bewkoof", "bewkuf", "bhadua", "bhaduaa", "bhadva", "bhadvaa",
    "bhadwa", "bhadwaa", "bhosada", "bhosda", "bhosdaa", "bhosdike", "bhonsdike", "bsdk",
    "bhosdiki", "bhosdiwala", "bhosdiwale", "bhosadchodal", "bhosadchod", "babbe", "babbey",
    "bube", "bubey", "bur", "burr", "buurr", "buur", "charsi", "chooche", "choochi", "chuchi",
    "chhod", "chod", "chodd", "chudne", "chudney", "chudwa", "chudwaa", "chudwane",
    "chudwaane", "choot", "chut", "chute", "chutia", "chutiya", "chutiye", "chuttad",
    "chutad", "dalaal", "dalal", "dalle", "dalley", "fattu", "gadha", "gadhe", "gadhalund",
    "gaand", "gand", "gandu", "gandfat", "gandfut", "gandiya", "gandiye", "goo", "gu", "gote",
    "gotey", "gotte", "hag", "haggu", "hagne", "hagney", "harami", "haramjada", "haraamjaada",
    "haramzyada", "haraamzyaada", "haraamjaade", "haraamzaade", "haraamkhor", "haramkhor",
    "jhat", "jhaat", "jhaatu", "jhatu", "kutta", "kutte", "kuttey", "kutia", "kutiya",
    "kuttiya", "kutti", "landi", "landy", "laude", "laudey", "laura", "lora", "lauda", "ling",
    "loda", "lode", "lund", "launda", "lounde", "laundey", "laundi", "loundi", "laundiya",
    "loundiya", "lulli", "maar", "maro", "marunga", "madarchod", "madarchodd", "madarchood",
    "madarchoot", "madarchut", "mc", "mamme", "mammey", "moot", "mut", "mootne", "mutne",
    "mooth", "muth", "nunni", "nunnu", "paaji", "paji", "pesaab", "pesab", "peshaab", "peshab",
    "pilla", "pillay", "pille", "pilley", "pisaab", "pisab", "pkmkb", "porkistan", "raand",
    "rand", "randi", "randy", "suar", "tatte", "tatti", "tatty", "ullu",
];

#[derive(Debug, Default)]
struct Node {
    children: HashMap<char, Node>,
    terminal: bool,
}

/// Letters (`L*`) and decimal digits (`Nd`) form tokens. Combining marks,
/// including spacing vowel signs, are boundaries.
fn is_token_char(ch: char) -> bool {
    matches!(
        get_general_category(ch),
        GeneralCategory::UppercaseLetter
            | GeneralCategory::LowercaseLetter
            | GeneralCategory::TitlecaseLetter
            | GeneralCategory::ModifierLetter
            | GeneralCategory::OtherLetter
            | GeneralCategory::DecimalNumber
    )
}

/// Immutable trie of blocked tokens.
///
/// Matching is case-insensitive and whole-token: a run of letters and digits is replaced by [`MASK`] only when the entire run is blocked.
/// Everything between tokens is copied through unchanged.
#[derive(Debug, Default)]
pub struct ContentFilter {
    root: Node,
    len: usize,
}

impl ContentFilter {
    /// Builds a filter from the given vocabulary.
    ///
    /// Words are trimmed and lowercased; blank entries are ignored.
    pub fn new<I, S>(words: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut filter = Self::default();
        for word in words {
            filter.insert(word.as_ref());
        }
        filter
    }

    /// Builds a filter over the built-in blocklist.
    #[must_use]
    pub fn with_default_blocklist() -> Self {
        Self::new(DEFAULT_BLOCKLIST.iter().copied())
    }

    fn insert(&mut self, word: &str) {
        let word = word.trim().to_lowercase();
        if word.is_empty() {
            return;
        }
        let mut node = &mut self.root;
        for ch in word.chars() {
            node = node.children.entry(ch).or_default();
        }
        if !node.terminal {
            node.terminal = true;
            self.len += 1;
        }
    }

    /// Number of distinct blocked words.
    #[must_use]
    pub fn len(&self) -> usize {
        self.len
    }

    /// Returns `true` if nothing is blocked.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Returns `true` if `token` is blocked, ignoring case.
    #[must_use]
    pub fn is_blocked(&self, token: &str) -> bool {
        let mut node = &self.root;
        for ch in token.chars().flat_map(char::to_lowercase) {
            match node.children.get(&ch) {
                Some(next) => node = next,
                None => return false,
            }
        }
        node.terminal
    }

    /// Returns `content` with every blocked token replaced by [`MASK`].
    #[must_use]
    pub fn mask(&self, content: &str) -> String {
        if self.is_empty() || content.is_empty() {
            return content.to_string();
        }
        let mut out = String::with_capacity(content.len());
        let mut token_start: Option<usize> = None;

        for (idx, ch) in content.char_indices() {
            if is_token_char(ch) {
                token_start.get_or_insert(idx);
                continue;
            }
            if let Some(start) = token_start.take() {
                self.flush(&content[start..idx], &mut out);
            }
            out.push(ch);
        }
        if let Some(start) = token_start {
            self.flush(&content[start..], &mut out);
        }
        out
    }

    fn flush(&self, token: &str, out: &mut String) {
        if self.is_blocked(token) {
            out.push_str(MASK);
        } else {
            out.push_str(token);
        }
    }
}
