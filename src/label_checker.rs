use std::fs;
use std::path::Path;

use hashbrown::HashMap;
use regex::Regex;
use tracing::info;

use crate::dictionary::StringDictionary;
use crate::errors::{Result, RumrfError};
use crate::LabelId;

/// Labels longer than this are never matched by regex rules and are marked
/// invalid outright.
const MAX_REGEX_LABEL_LEN: usize = 100;

enum RuleBody {
    Literal(String),
    Pattern(Regex),
}

struct CheckingRule {
    valid: bool,
    body: RuleBody,
}

impl CheckingRule {
    fn new(valid: bool, body: &str) -> Result<Self> {
        let body = if is_regex(body) {
            // The whole label must match, as with `regex_match`.
            let re = Regex::new(&format!("^(?:{body})$"))
                .map_err(|_| RumrfError::rule_syntax(body.to_string()))?;
            RuleBody::Pattern(re)
        } else {
            RuleBody::Literal(body.to_string())
        };
        Ok(Self { valid, body })
    }
}

fn is_regex(s: &str) -> bool {
    s.bytes().any(|b| {
        matches!(
            b,
            b'.' | b'?'
                | b'+'
                | b'*'
                | b'('
                | b')'
                | b'['
                | b']'
                | b'{'
                | b'}'
                | b'\\'
                | b'|'
                | b'$'
                | b'^'
        )
    })
}

/// Decides whether a label may be produced by inference.
///
/// Rules come from a text file with one rule per line: `+body` allows,
/// `-body` disallows, `#`/`%` start comments and empty lines are skipped.
/// A body containing any regex metacharacter is a pattern, otherwise it is a
/// literal. Rules are applied in file order and the last matching rule wins.
///
/// Interned labels get their verdicts precomputed by sweeping the dictionary;
/// an interned label no rule ever touches is invalid. Labels outside the
/// dictionary are checked against the rule list directly and start out valid.
#[derive(Default)]
pub struct LabelChecker {
    rules: Vec<CheckingRule>,
    verdicts: HashMap<LabelId, bool>,
    loaded: bool,
}

impl LabelChecker {
    /// Creates a checker that accepts every label.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns whether rules have been loaded.
    #[must_use]
    pub fn is_loaded(&self) -> bool {
        self.loaded
    }

    /// Loads rules from a file and precomputes verdicts for every label
    /// interned in `dict`.
    ///
    /// # Errors
    ///
    /// Fails if the file cannot be read, a line does not start with `+`, `-`,
    /// `#` or `%`, or a pattern does not compile.
    pub fn load<P>(&mut self, path: P, dict: &StringDictionary) -> Result<()>
    where
        P: AsRef<Path>,
    {
        let text = fs::read_to_string(path)?;
        self.load_str(&text, dict)
    }

    /// Loads rules from already-read text. See [`load`](Self::load).
    pub fn load_str(&mut self, text: &str, dict: &StringDictionary) -> Result<()> {
        self.rules = parse_rules(text)?;
        info!(num_rules = self.rules.len(), "loaded label rules");
        self.apply_rules_on_dictionary(dict);
        self.loaded = true;
        Ok(())
    }

    /// Returns whether an interned label id is a valid inference output.
    #[must_use]
    pub fn is_valid(&self, label: LabelId) -> bool {
        if !self.loaded {
            return true;
        }
        self.verdicts.get(&label).copied().unwrap_or(false)
    }

    /// Returns whether a label outside the dictionary is a valid inference
    /// output.
    #[must_use]
    pub fn is_valid_string(&self, s: &str) -> bool {
        let mut valid = true;
        for rule in &self.rules {
            let matched = match &rule.body {
                RuleBody::Literal(lit) => lit == s,
                RuleBody::Pattern(re) => re.is_match(s),
            };
            if matched {
                valid = rule.valid;
            }
        }
        valid
    }

    fn apply_rules_on_dictionary(&mut self, dict: &StringDictionary) {
        self.verdicts.clear();
        for rule in &self.rules {
            match &rule.body {
                RuleBody::Pattern(re) => {
                    for (id, name) in dict.iter() {
                        if name.len() > MAX_REGEX_LABEL_LEN {
                            self.verdicts.insert(id, false);
                            continue;
                        }
                        if re.is_match(name) {
                            self.verdicts.insert(id, rule.valid);
                        }
                    }
                }
                RuleBody::Literal(lit) => {
                    if let Some(id) = dict.find(lit) {
                        self.verdicts.insert(id, rule.valid);
                    }
                }
            }
        }
    }
}

fn parse_rules(text: &str) -> Result<Vec<CheckingRule>> {
    let mut rules = vec![];
    for line in text.lines() {
        let line = line.trim_end_matches(['\n', '\r']);
        if line.is_empty() {
            continue;
        }
        match line.as_bytes()[0] {
            b'+' => rules.push(CheckingRule::new(true, &line[1..])?),
            b'-' => rules.push(CheckingRule::new(false, &line[1..])?),
            b'#' | b'%' => {}
            _ => return Err(RumrfError::rule_syntax(line.to_string())),
        }
    }
    Ok(rules)
}
