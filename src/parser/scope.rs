use std::sync::LazyLock;

use scraper::{ElementRef, Html, Selector};
use tracing::debug;

use super::clean::clean_text;

static H3: LazyLock<Selector> = LazyLock::new(|| Selector::parse("h3").unwrap());
static H4: LazyLock<Selector> = LazyLock::new(|| Selector::parse("h4").unwrap());

/// Outcome of scoping a document to one (mode, tense) cell.
pub enum Scoped<'a> {
    Cell(ElementRef<'a>),
    MissingMode,
    MissingTense,
}

/// Find the conjugation `<p>` for `tense` under the `<h3>` named `mode`.
///
/// Every `<h3>` whose cleaned text equals `mode` contributes its parent as a
/// search container, in document order. Inside a container an `<h4>` only
/// counts when its owning heading is `mode`, so tense blocks of another mode
/// nested somewhere below the container are skipped.
pub fn locate_cell<'a>(doc: &'a Html, mode: &str, tense: &str) -> Scoped<'a> {
    let containers: Vec<ElementRef<'a>> = doc
        .select(&H3)
        .filter(|h3| heading_text(*h3) == mode)
        .filter_map(|h3| h3.parent().and_then(ElementRef::wrap))
        .collect();

    if containers.is_empty() {
        let seen: Vec<String> = doc.select(&H3).map(heading_text).collect();
        debug!(mode, ?seen, "mode heading not found");
        return Scoped::MissingMode;
    }

    for container in containers {
        let cell = container
            .select(&H4)
            .filter(|h4| heading_text(*h4) == tense)
            .filter(|h4| owning_mode(*h4).as_deref() == Some(mode))
            .find_map(following_paragraph);
        if let Some(p) = cell {
            return Scoped::Cell(p);
        }
    }

    Scoped::MissingTense
}

fn heading_text(el: ElementRef<'_>) -> String {
    clean_text(&el.text().collect::<Vec<_>>().join(" "))
}

/// Nearest `<h3>` that precedes `el` among its own siblings or the siblings
/// of one of its ancestors, closest level first.
fn owning_mode(el: ElementRef<'_>) -> Option<String> {
    let mut node = *el;
    loop {
        let heading = node
            .prev_siblings()
            .filter_map(ElementRef::wrap)
            .find(|e| e.value().name() == "h3");
        if let Some(h3) = heading {
            return Some(heading_text(h3));
        }
        node = node.parent()?;
    }
}

fn following_paragraph(h4: ElementRef<'_>) -> Option<ElementRef<'_>> {
    h4.next_siblings()
        .filter_map(ElementRef::wrap)
        .find(|e| e.value().name() == "p")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cell_text(html: &str, mode: &str, tense: &str) -> Option<String> {
        let doc = Html::parse_document(html);
        match locate_cell(&doc, mode, tense) {
            Scoped::Cell(p) => Some(clean_text(&p.text().collect::<String>())),
            _ => None,
        }
    }

    #[test]
    fn flat_layout_uses_nearest_heading() {
        let html = "<div>\
            <h3>Subjuntivo</h3><h4>Presente</h4><p>que eu fale</p>\
            <h3>Indicativo</h3><h4>Presente</h4><p>eu falo</p>\
        </div>";
        assert_eq!(cell_text(html, "Indicativo", "Presente").as_deref(), Some("eu falo"));
        assert_eq!(cell_text(html, "Subjuntivo", "Presente").as_deref(), Some("que eu fale"));
    }

    #[test]
    fn nested_foreign_block_skipped() {
        let html = "<section><h3>Indicativo</h3>\
            <aside><div><h3>Subjuntivo</h3><div><h4>Presente</h4><p>que eu fale</p></div></div></aside>\
            <div><h4>Presente</h4><p>eu falo</p></div>\
        </section>";
        assert_eq!(cell_text(html, "Indicativo", "Presente").as_deref(), Some("eu falo"));
    }

    #[test]
    fn mode_match_is_case_sensitive() {
        let html = "<div><h3>indicativo</h3><h4>Presente</h4><p>eu falo</p></div>";
        let doc = Html::parse_document(html);
        assert!(matches!(locate_cell(&doc, "Indicativo", "Presente"), Scoped::MissingMode));
    }

    #[test]
    fn heading_without_paragraph() {
        let html = "<div><h3>Indicativo</h3><div>No paragraph here</div></div>";
        let doc = Html::parse_document(html);
        assert!(matches!(locate_cell(&doc, "Indicativo", "Presente"), Scoped::MissingTense));
    }
}
