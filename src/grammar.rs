//! Closed reference sets (modes, tenses, persons) and task validation.
//!
//! Everything that reaches the fetcher or the database has passed through
//! [`Task::new`] first.

use std::fmt;
use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::{Result, ScrapeError};

static VERB_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[a-zA-Záàâãéèêíïóôõöúçñ -]+$").unwrap());

pub const MAX_VERB_LEN: usize = 20;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Mode {
    Indicativo,
    Subjuntivo,
    Imperativo,
}

impl Mode {
    pub const ALL: [Mode; 3] = [Mode::Indicativo, Mode::Subjuntivo, Mode::Imperativo];

    pub fn name(self) -> &'static str {
        match self {
            Mode::Indicativo => "Indicativo",
            Mode::Subjuntivo => "Subjuntivo",
            Mode::Imperativo => "Imperativo",
        }
    }

    /// Tenses the upstream publishes under this mode, in page order.
    pub fn tenses(self) -> &'static [&'static str] {
        match self {
            Mode::Indicativo => &[
                "Presente",
                "Pretérito Imperfeito",
                "Pretérito Perfeito",
                "Pretérito Mais-que-perfeito",
                "Futuro do Presente",
                "Futuro do Pretérito",
            ],
            Mode::Subjuntivo => &["Presente", "Pretérito Imperfeito", "Futuro"],
            Mode::Imperativo => &["Afirmativo", "Negativo"],
        }
    }

    pub fn parse(name: &str) -> Result<Mode> {
        Mode::ALL
            .into_iter()
            .find(|m| m.name() == name)
            .ok_or_else(|| ScrapeError::Validation(format!("unknown mode '{}'", name)))
    }

    /// Returns the canonical `&'static str` for `tense` if it belongs to this mode.
    pub fn tense(self, tense: &str) -> Result<&'static str> {
        self.tenses()
            .iter()
            .copied()
            .find(|t| *t == tense)
            .ok_or_else(|| {
                ScrapeError::Validation(format!(
                    "tense '{}' is not part of mode {}",
                    tense,
                    self.name()
                ))
            })
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Person {
    Eu,
    Tu,
    Ele,
    Nos,
    Vos,
    Eles,
}

impl Person {
    /// Canonical order of every conjugation table.
    pub const ALL: [Person; 6] = [
        Person::Eu,
        Person::Tu,
        Person::Ele,
        Person::Nos,
        Person::Vos,
        Person::Eles,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Person::Eu => "eu",
            Person::Tu => "tu",
            Person::Ele => "ele",
            Person::Nos => "nós",
            Person::Vos => "vós",
            Person::Eles => "eles",
        }
    }

    pub fn sort_order(self) -> i64 {
        Person::ALL.iter().position(|p| *p == self).unwrap_or(0) as i64
    }
}

/// Unvalidated task descriptor as a caller hands it over.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskRequest {
    pub verb: String,
    pub mode: String,
    pub tense: String,
}

impl TaskRequest {
    pub fn new(verb: &str, mode: &str, tense: &str) -> Self {
        TaskRequest {
            verb: verb.to_string(),
            mode: mode.to_string(),
            tense: tense.to_string(),
        }
    }
}

/// A validated (verb, mode, tense) unit of work. Only [`Task::new`] builds one.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Task {
    verb: String,
    mode: Mode,
    tense: &'static str,
}

impl Task {
    pub fn new(verb: &str, mode: &str, tense: &str) -> Result<Task> {
        let verb = normalize_verb(verb)?;
        let mode = Mode::parse(mode)?;
        let tense = mode.tense(tense)?;
        Ok(Task { verb, mode, tense })
    }

    pub fn from_request(req: &TaskRequest) -> Result<Task> {
        Task::new(&req.verb, &req.mode, &req.tense)
    }

    pub fn verb(&self) -> &str {
        &self.verb
    }

    pub fn mode(&self) -> Mode {
        self.mode
    }

    pub fn tense(&self) -> &'static str {
        self.tense
    }
}

impl fmt::Display for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({} {})", self.verb, self.mode, self.tense)
    }
}

/// Trim, check charset and length, lowercase.
pub fn normalize_verb(raw: &str) -> Result<String> {
    let verb = raw.trim();
    if verb.is_empty() {
        return Err(ScrapeError::Validation("verb is empty".into()));
    }
    if verb.chars().count() > MAX_VERB_LEN {
        return Err(ScrapeError::Validation(format!(
            "verb '{}' exceeds {} characters",
            verb, MAX_VERB_LEN
        )));
    }
    if !VERB_RE.is_match(verb) {
        return Err(ScrapeError::Validation(format!(
            "verb '{}' contains invalid characters",
            verb
        )));
    }
    Ok(verb.to_lowercase())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn whitelist_sizes() {
        assert_eq!(Mode::Indicativo.tenses().len(), 6);
        assert_eq!(Mode::Subjuntivo.tenses().len(), 3);
        assert_eq!(Mode::Imperativo.tenses().len(), 2);
    }

    #[test]
    fn task_normalizes_verb() {
        let t = Task::new("  Falar ", "Indicativo", "Presente").unwrap();
        assert_eq!(t.verb(), "falar");
        assert_eq!(t.mode(), Mode::Indicativo);
        assert_eq!(t.tense(), "Presente");
    }

    #[test]
    fn accented_verbs_accepted() {
        assert_eq!(normalize_verb("Pôr").unwrap(), "pôr");
        assert_eq!(normalize_verb("bem-querer").unwrap(), "bem-querer");
    }

    #[test]
    fn rejects_bad_verbs() {
        for bad in ["", "   ", "falar/../x", "ir?x=1", "a1", "abcdefghijklmnopqrstu"] {
            assert!(
                matches!(normalize_verb(bad), Err(ScrapeError::Validation(_))),
                "accepted {:?}",
                bad
            );
        }
    }

    #[test]
    fn requests_only_become_tasks_through_validation() {
        let bad = TaskRequest::new("../x", "Indicativo", "Presente");
        assert!(matches!(Task::from_request(&bad), Err(ScrapeError::Validation(_))));
        let good = Task::from_request(&TaskRequest::new("Ir", "Subjuntivo", "Futuro")).unwrap();
        assert_eq!((good.verb(), good.mode(), good.tense()), ("ir", Mode::Subjuntivo, "Futuro"));
    }

    #[test]
    fn inner_control_whitespace_rejected() {
        for bad in ["fa\nlar", "fa\tlar", "fa\rlar", "fa\u{00A0}lar"] {
            assert!(
                matches!(normalize_verb(bad), Err(ScrapeError::Validation(_))),
                "accepted {:?}",
                bad
            );
        }
        // Surrounding whitespace is still trimmed away.
        assert_eq!(normalize_verb("\tfalar\n").unwrap(), "falar");
    }

    #[test]
    fn tense_must_belong_to_mode() {
        assert!(Task::new("ir", "Subjuntivo", "Futuro").is_ok());
        assert!(Task::new("ir", "Indicativo", "Futuro").is_err());
        assert!(Task::new("ir", "Imperativo", "Presente").is_err());
        assert!(Task::new("ir", "indicativo", "Presente").is_err());
    }

    #[test]
    fn person_order() {
        let names: Vec<&str> = Person::ALL.iter().map(|p| p.name()).collect();
        assert_eq!(names, ["eu", "tu", "ele", "nós", "vós", "eles"]);
        assert_eq!(Person::Eles.sort_order(), 5);
    }
}
