pub mod clean;
pub mod scope;

use std::sync::LazyLock;

use regex::Regex;
use scraper::Html;
use serde::Serialize;

use crate::error::{Result, ScrapeError};
use crate::grammar::{Person, Task};
use clean::clean_text;
use scope::Scoped;

static BR_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(?i)<br\s*/?>").unwrap());

/// Six conjugated forms in canonical person order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PersonForms([String; 6]);

impl PersonForms {
    pub fn get(&self, person: Person) -> &str {
        &self.0[person.sort_order() as usize]
    }

    pub fn iter(&self) -> impl Iterator<Item = (Person, &str)> {
        Person::ALL.into_iter().zip(self.0.iter().map(String::as_str))
    }

    pub fn as_slice(&self) -> &[String] {
        &self.0
    }
}

impl TryFrom<Vec<String>> for PersonForms {
    type Error = Vec<String>;

    fn try_from(forms: Vec<String>) -> std::result::Result<Self, Self::Error> {
        <[String; 6]>::try_from(forms).map(PersonForms)
    }
}

/// Markup → six forms: scope to the mode, find the tense cell, split on
/// `<br>`, clean each line.
pub fn extract_conjugations(html: &str, task: &Task) -> Result<PersonForms> {
    let doc = Html::parse_document(html);
    let fail = |reason: String| ScrapeError::Extraction {
        verb: task.verb().to_string(),
        mode: task.mode().name().to_string(),
        tense: task.tense().to_string(),
        reason,
    };

    let cell = match scope::locate_cell(&doc, task.mode().name(), task.tense()) {
        Scoped::Cell(p) => p,
        Scoped::MissingMode => return Err(fail(format!("mode '{}' not on page", task.mode()))),
        Scoped::MissingTense => {
            return Err(fail(format!(
                "tense '{}' not found under {}",
                task.tense(),
                task.mode()
            )))
        }
    };

    let lines = split_lines(&cell.inner_html());
    PersonForms::try_from(lines)
        .map_err(|lines| fail(format!("expected 6 forms, found {}: {:?}", lines.len(), lines)))
}

/// One string per `<br>`-separated part, empty parts dropped.
fn split_lines(inner_html: &str) -> Vec<String> {
    BR_RE
        .split(inner_html)
        .map(|part| {
            let fragment = Html::parse_fragment(part);
            let text = fragment.root_element().text().collect::<Vec<_>>().join(" ");
            clean_text(&text)
        })
        .filter(|line| !line.is_empty())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::grammar::Mode;

    fn fixture(name: &str) -> String {
        std::fs::read_to_string(format!("tests/fixtures/{}.html", name)).unwrap()
    }

    fn task(verb: &str, mode: &str, tense: &str) -> Task {
        Task::new(verb, mode, tense).unwrap()
    }

    #[test]
    fn falar_indicativo_presente() {
        let forms = extract_conjugations(&fixture("falar"), &task("falar", "Indicativo", "Presente")).unwrap();
        assert_eq!(
            forms.as_slice(),
            ["eu falo", "tu falas", "ele fala", "nós falamos", "vós falais", "eles falam"]
        );
        assert_eq!(forms.get(Person::Nos), "nós falamos");
    }

    #[test]
    fn every_whitelisted_pair_yields_six() {
        let html = fixture("falar");
        for mode in Mode::ALL {
            for tense in mode.tenses() {
                let forms = extract_conjugations(&html, &task("falar", mode.name(), tense))
                    .unwrap_or_else(|e| panic!("{} {}: {}", mode, tense, e));
                assert_eq!(forms.as_slice().len(), 6);
                assert!(forms.iter().all(|(_, f)| !f.is_empty() && f.trim() == f));
            }
        }
    }

    #[test]
    fn shared_tense_name_follows_requested_mode() {
        let html = fixture("falar");
        let ind = extract_conjugations(&html, &task("falar", "Indicativo", "Presente")).unwrap();
        let sub = extract_conjugations(&html, &task("falar", "Subjuntivo", "Presente")).unwrap();
        assert_eq!(ind.get(Person::Eu), "eu falo");
        assert_eq!(sub.get(Person::Eu), "que eu fale");
    }

    #[test]
    fn duplicate_headers_fixture() {
        // Subjuntivo comes first in document order and a Subjuntivo block is
        // nested inside the Indicativo container.
        let html = fixture("duplicate_headers");
        let ind = extract_conjugations(&html, &task("falar", "Indicativo", "Presente")).unwrap();
        assert_eq!(ind.get(Person::Eu), "eu falo");
        assert_eq!(ind.get(Person::Eles), "eles falam");
        let sub = extract_conjugations(&html, &task("falar", "Subjuntivo", "Presente")).unwrap();
        assert_eq!(sub.get(Person::Eu), "que eu fale");
    }

    #[test]
    fn irregular_verb_with_messy_markup() {
        let forms = extract_conjugations(&fixture("ir"), &task("ir", "Indicativo", "Presente")).unwrap();
        assert_eq!(forms.get(Person::Eu), "eu vou");
        assert_eq!(forms.get(Person::Tu), "tu vais");
        assert_eq!(forms.get(Person::Eles), "eles vão");
    }

    #[test]
    fn missing_mode_is_extraction_error() {
        let html = "<div><h3>Indicativo</h3><h4>Presente</h4><p>eu falo</p></div>";
        let err = extract_conjugations(html, &task("falar", "Subjuntivo", "Presente")).unwrap_err();
        match err {
            ScrapeError::Extraction { verb, mode, tense, .. } => {
                assert_eq!((verb.as_str(), mode.as_str(), tense.as_str()), ("falar", "Subjuntivo", "Presente"));
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn incomplete_markup_is_extraction_error() {
        let html = "<h3>Indicativo</h3><div>No paragraph here</div>";
        let err = extract_conjugations(html, &task("broken", "Indicativo", "Presente")).unwrap_err();
        assert_eq!(err.kind(), "extraction");
    }

    #[test]
    fn short_table_never_padded() {
        let html = "<div><h3>Indicativo</h3><h4>Presente</h4>\
            <p>eu falo<br>tu falas<br>ele fala<br>nós falamos<br>vós falais</p></div>";
        let err = extract_conjugations(html, &task("falar", "Indicativo", "Presente")).unwrap_err();
        assert!(err.to_string().contains("found 5"));
    }

    #[test]
    fn splits_on_br_not_whitespace() {
        let lines = split_lines("que eu <b>fale</b><br/>\n que tu&nbsp;fales <BR >que ele fale<br>");
        assert_eq!(lines, ["que eu fale", "que tu fales", "que ele fale"]);
    }
}
