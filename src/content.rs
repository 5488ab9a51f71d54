//! Chapter markup to narratable text blocks.
//!
//! Shaping happens on the whole body before blocks are cut:
//! superscripts (footnote markers) are dropped, spans are flattened to their
//! text, and quote/heading divisions get spoken annotations. Each top-level
//! child of the body then becomes one block, except tables, which are
//! summarized rather than read cell by cell.

use crate::archive::Archive;
use crate::error::{BookError, Result};
use crate::markup::{self, Element, Node};
use crate::navigation::ChapterDescriptor;
use tracing::debug;

const QUOTE_CLASS_PREFIX: &str = "blockquote";
const HEADING_CLASS: &str = "head";

/// Load a chapter's entry and return its text blocks in document order.
pub fn load_blocks<A: Archive + ?Sized>(
    archive: &mut A,
    chapter: &ChapterDescriptor,
) -> Result<Vec<String>> {
    let path = chapter.source_entry_path.as_str();
    if !archive.contains(path) {
        return Err(BookError::ChapterEntryMissing {
            path: path.to_string(),
            available: archive.entries(),
        });
    }
    let source = archive.read_text(path)?;
    let blocks = extract_blocks(&source).map_err(|message| BookError::Markup {
        path: path.to_string(),
        message,
    })?;
    debug!(
        chapter = %chapter.label,
        path,
        blocks = blocks.len(),
        "Extracted chapter blocks"
    );
    Ok(blocks)
}

/// Shape a markup document and cut it into blocks.
pub fn extract_blocks(source: &str) -> std::result::Result<Vec<String>, String> {
    let mut document = markup::parse(source)?;
    let mut scope = document.take("body").unwrap_or(document);

    shape(&mut scope);

    Ok(scope
        .children
        .iter()
        .filter(|node| !node.text().trim().is_empty())
        .map(|node| match node {
            Node::Element(table) if table.is("table") => table_summary(table),
            other => other.text(),
        })
        .collect())
}

fn shape(scope: &mut Element) {
    scope.remove_all("sup");
    scope.replace_with_text("span");
    scope.for_each_mut("div", &mut |div| {
        let Some(class) = div.attr("class").map(str::to_string) else {
            return;
        };
        if class.starts_with(QUOTE_CLASS_PREFIX) {
            div.prepend_text("Quote: ");
        }
        if class == HEADING_CLASS {
            div.prepend_text("Heading: ");
            div.append_text(".");
        }
    });
}

fn table_summary(table: &Element) -> String {
    let rows = table_rows(table);
    let columns = rows
        .first()
        .map(|row| {
            row.child_elements()
                .filter(|cell| cell.is("td") || cell.is("th"))
                .count()
        })
        .unwrap_or(0);
    format!("Table with {} rows and {} columns.", rows.len(), columns)
}

/// Rows directly under the table or under its row groups.
fn table_rows(table: &Element) -> Vec<&Element> {
    let mut rows = Vec::new();
    for child in table.child_elements() {
        if child.is("tr") {
            rows.push(child);
        } else if child.is("thead") || child.is("tbody") || child.is("tfoot") {
            rows.extend(child.child_elements().filter(|row| row.is("tr")));
        }
    }
    rows
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::archive::MemoryArchive;

    fn chapter(path: &str) -> ChapterDescriptor {
        ChapterDescriptor {
            source_entry_path: path.to_string(),
            fragment_id: String::new(),
            label: "One".to_string(),
            play_order: 1,
            nav_class: "chapter".to_string(),
        }
    }

    #[test]
    fn table_is_summarized_not_read() {
        let html = "<html><body><table>\
            <tr><td>a</td><td>b</td></tr>\
            <tr><td>c</td><td>d</td></tr>\
            <tr><td>e</td><td>f</td></tr>\
            </table></body></html>";
        let blocks = extract_blocks(html).unwrap();
        assert_eq!(blocks, vec!["Table with 3 rows and 2 columns."]);
    }

    #[test]
    fn table_rows_inside_tbody_are_counted() {
        let html = "<body><table><thead><tr><th>h1</th><th>h2</th><th>h3</th></tr></thead>\
            <tbody><tr><td>1</td><td>2</td><td>3</td></tr></tbody></table></body>";
        let blocks = extract_blocks(html).unwrap();
        assert_eq!(blocks, vec!["Table with 2 rows and 3 columns."]);
    }

    #[test]
    fn superscripts_are_dropped_and_spans_flattened() {
        let html = "<body><p>Call me <span class=\"i\">Ishmael</span>.<sup>1</sup></p></body>";
        assert_eq!(extract_blocks(html).unwrap(), vec!["Call me Ishmael."]);
    }

    #[test]
    fn quote_and_heading_divisions_are_annotated() {
        let html = "<body>\
            <div class=\"head\">Chapter One</div>\
            <div class=\"blockquote-indent\">To be or not</div>\
            <div class=\"header\">Untouched</div>\
            <div>No class</div>\
            </body>";
        assert_eq!(
            extract_blocks(html).unwrap(),
            vec![
                "Heading: Chapter One.",
                "Quote: To be or not",
                "Untouched",
                "No class",
            ]
        );
    }

    #[test]
    fn nested_divisions_are_annotated_too() {
        let html = "<body><div><div class=\"blockquote\">inner</div></div></body>";
        assert_eq!(extract_blocks(html).unwrap(), vec!["Quote: inner"]);
    }

    #[test]
    fn blank_blocks_are_dropped() {
        let html = "<body>\n  <p>   </p>\n  <p>Kept</p>\n  <p><sup>2</sup></p>\n</body>";
        assert_eq!(extract_blocks(html).unwrap(), vec!["Kept"]);
    }

    #[test]
    fn bare_text_under_body_is_a_block() {
        let html = "<body>loose words<p>para</p></body>";
        assert_eq!(extract_blocks(html).unwrap(), vec!["loose words", "para"]);
    }

    #[test]
    fn documents_without_body_use_the_whole_tree() {
        let html = "<p>one</p><p>two</p>";
        assert_eq!(extract_blocks(html).unwrap(), vec!["one", "two"]);
    }

    #[test]
    fn missing_chapter_entry_names_the_path() {
        let mut archive = MemoryArchive::new().with_entry("toc.ncx", "<ncx/>");
        let err = load_blocks(&mut archive, &chapter("ch1.html")).expect_err("missing entry");
        match err {
            BookError::ChapterEntryMissing { path, available } => {
                assert_eq!(path, "ch1.html");
                assert_eq!(available, vec!["toc.ncx".to_string()]);
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn loads_blocks_from_archive_entry() {
        let mut archive =
            MemoryArchive::new().with_entry("ch1.html", "<html><body><p>Hello.</p></body></html>");
        let blocks = load_blocks(&mut archive, &chapter("ch1.html")).unwrap();
        assert_eq!(blocks, vec!["Hello."]);
    }
}
