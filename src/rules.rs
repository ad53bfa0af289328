// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Rule matcher (module J): exact-then-suffix domain lookup with a
//! fallback, grounded on `p3/server/rulematcher.py`'s `RuleMatcher`.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Mutex;

#[derive(Clone, Copy, Debug, PartialEq, Eq, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Rule {
    Block,
    Direct,
    Forward,
}

pub struct RuleTable {
    map: HashMap<String, Rule>,
    fallback: Rule,
    cache: Mutex<HashMap<String, Rule>>,
}

impl RuleTable {
    /// No rules loaded: every lookup returns `fallback`.
    pub fn empty(fallback: Rule) -> Self {
        RuleTable {
            map: HashMap::new(),
            fallback,
            cache: Mutex::new(HashMap::new()),
        }
    }

    /// Load `verb domain` pairs from a plain-text file. `#` starts a
    /// comment, blank lines are ignored, the first occurrence of a domain
    /// wins.
    pub fn load(path: &Path, fallback: Rule) -> std::io::Result<Self> {
        let text = std::fs::read_to_string(path)?;
        let map = Self::parse(&text);
        Ok(RuleTable {
            map,
            fallback,
            cache: Mutex::new(HashMap::new()),
        })
    }

    fn parse(text: &str) -> HashMap<String, Rule> {
        let mut map = HashMap::new();
        for line in text.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let mut parts = line.split_whitespace();
            let (Some(verb), Some(domain)) = (parts.next(), parts.next()) else {
                continue;
            };
            let rule = match verb {
                "block" => Rule::Block,
                "direct" => Rule::Direct,
                "forward" => Rule::Forward,
                _ => continue,
            };
            map.entry(domain.to_string()).or_insert(rule);
        }
        map
    }

    /// Exact-then-suffix lookup: try the full host, then strip the
    /// leftmost DNS label and retry, until one label remains, then the
    /// fallback. Memoized per host.
    pub fn lookup(&self, host: &str) -> Rule {
        if self.map.is_empty() {
            return self.fallback;
        }
        if let Some(cached) = self.cache.lock().unwrap().get(host) {
            return *cached;
        }

        let mut cur = host;
        let result = loop {
            if let Some(rule) = self.map.get(cur) {
                break *rule;
            }
            match cur.find('.') {
                Some(idx) => cur = &cur[idx + 1..],
                None => break self.fallback,
            }
        };

        self.cache.lock().unwrap().insert(host.to_string(), result);
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table() -> RuleTable {
        RuleTable {
            map: RuleTable::parse("block ads.example\nforward example\n# comment\n\ndirect c.example\n"),
            fallback: Rule::Direct,
            cache: Mutex::new(HashMap::new()),
        }
    }

    #[test]
    fn exact_then_suffix_then_fallback() {
        let t = table();
        assert_eq!(t.lookup("a.b.c.example"), Rule::Direct); // matches c.example level
        assert_eq!(t.lookup("x.example"), Rule::Forward); // falls to "example"
        assert_eq!(t.lookup("ads.example"), Rule::Block); // exact short-circuit
        assert_eq!(t.lookup("totally.unrelated"), Rule::Direct); // fallback
    }

    #[test]
    fn unloaded_rules_always_fallback() {
        let t = RuleTable::empty(Rule::Block);
        assert_eq!(t.lookup("anything.example"), Rule::Block);
    }

    #[test]
    fn first_occurrence_wins() {
        let map = RuleTable::parse("block dup.example\nforward dup.example\n");
        assert_eq!(map.get("dup.example"), Some(&Rule::Block));
    }
}
