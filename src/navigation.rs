//! Chapter discovery: container descriptor -> package document -> NCX.
//!
//! Only navigation points whose class is `chapter` become chapters, and they
//! keep the order of the NCX document rather than their `playOrder`.

use crate::archive::Archive;
use crate::error::{BookError, Result};
use crate::markup::{self, Element};
use serde::Serialize;
use std::collections::HashMap;
use tracing::{debug, info, warn};

pub const CONTAINER_PATH: &str = "META-INF/container.xml";
pub const CHAPTER_CLASS: &str = "chapter";

/// One narratable entry of the table of contents.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChapterDescriptor {
    pub source_entry_path: String,
    pub fragment_id: String,
    pub label: String,
    pub play_order: i64,
    pub nav_class: String,
}

pub fn resolve_chapters<A: Archive + ?Sized>(archive: &mut A) -> Result<Vec<ChapterDescriptor>> {
    let entries = archive.entries();
    let container = find_container(&entries).ok_or_else(|| BookError::MalformedArchive {
        reason: format!("no {CONTAINER_PATH} among {} entries", entries.len()),
    })?;
    debug!(container = %container, "Found container descriptor");

    let package_path = read_package_path(archive, &container)?;
    let toc_path = read_toc_path(archive, &package_path)?;
    let chapters = read_nav_points(archive, &toc_path)?;

    info!(
        package = %package_path,
        toc = %toc_path,
        chapters = chapters.len(),
        "Resolved chapter list"
    );
    Ok(chapters)
}

fn find_container(entries: &[String]) -> Option<String> {
    entries
        .iter()
        .find(|entry| entry.eq_ignore_ascii_case(CONTAINER_PATH))
        .cloned()
}

fn parse_entry<A: Archive + ?Sized>(archive: &mut A, path: &str) -> Result<Element> {
    let source = archive.read_text(path)?;
    markup::parse(&source).map_err(|message| BookError::Markup {
        path: path.to_string(),
        message,
    })
}

fn read_package_path<A: Archive + ?Sized>(archive: &mut A, container: &str) -> Result<String> {
    let doc = parse_entry(archive, container)?;
    let rootfile = doc
        .find("rootfile")
        .and_then(|root| root.attr("full-path"))
        .ok_or_else(|| BookError::MalformedArchive {
            reason: format!("{container} declares no rootfile"),
        })?;
    if !archive.contains(rootfile) {
        return Err(BookError::MalformedArchive {
            reason: format!("package document {rootfile} is not in the archive"),
        });
    }
    Ok(rootfile.to_string())
}

fn read_toc_path<A: Archive + ?Sized>(archive: &mut A, package_path: &str) -> Result<String> {
    let doc = parse_entry(archive, package_path)?;

    let mut href_by_id: HashMap<&str, &str> = HashMap::new();
    for item in doc.find_all("item") {
        if let (Some(id), Some(href)) = (item.attr("id"), item.attr("href")) {
            href_by_id.insert(id, href);
        }
    }
    debug!(items = href_by_id.len(), "Indexed manifest items");

    let toc_id = doc
        .find("spine")
        .and_then(|spine| spine.attr("toc"))
        .ok_or_else(|| BookError::MissingNavigation {
            reason: format!("spine in {package_path} has no toc attribute"),
        })?;
    let href = href_by_id
        .get(toc_id)
        .ok_or_else(|| BookError::MissingNavigation {
            reason: format!("toc id {toc_id} is not a manifest item"),
        })?;

    let toc_path = resolve_href(package_path, href);
    if !archive.contains(&toc_path) {
        return Err(BookError::MissingNavigation {
            reason: format!("navigation document {toc_path} is not in the archive"),
        });
    }
    Ok(toc_path)
}

fn read_nav_points<A: Archive + ?Sized>(
    archive: &mut A,
    toc_path: &str,
) -> Result<Vec<ChapterDescriptor>> {
    let doc = parse_entry(archive, toc_path)?;
    let points = doc.find_all("navPoint");
    let total = points.len();

    let chapters: Vec<ChapterDescriptor> = points
        .into_iter()
        .filter_map(|point| describe_point(point, toc_path))
        .filter(|chapter| chapter.nav_class == CHAPTER_CLASS)
        .collect();

    debug!(
        nav_points = total,
        chapters = chapters.len(),
        "Filtered navigation points"
    );
    Ok(chapters)
}

fn describe_point(point: &Element, toc_path: &str) -> Option<ChapterDescriptor> {
    let Some(src) = point.find("content").and_then(|content| content.attr("src")) else {
        warn!(
            id = point.attr("id").unwrap_or_default(),
            "Skipping navPoint without content src"
        );
        return None;
    };
    let (path, fragment) = split_src(src);
    Some(ChapterDescriptor {
        source_entry_path: resolve_href(toc_path, path),
        fragment_id: fragment.to_string(),
        label: point
            .find("navLabel")
            .map(|label| label.text().trim().to_string())
            .unwrap_or_default(),
        play_order: point
            .attr("playOrder")
            .and_then(|order| order.trim().parse().ok())
            .unwrap_or(0),
        nav_class: point.attr("class").unwrap_or_default().to_string(),
    })
}

/// Split `path?query#fragment` into the path and the fragment.
fn split_src(src: &str) -> (&str, &str) {
    let (before_hash, fragment) = src.split_once('#').unwrap_or((src, ""));
    let path = before_hash
        .split_once('?')
        .map_or(before_hash, |(path, _)| path);
    (path, fragment)
}

/// Resolve `href` against the directory of the document that declared it.
fn resolve_href(base_document: &str, href: &str) -> String {
    let mut parts: Vec<&str> = match base_document.rsplit_once('/') {
        Some((dir, _)) => dir.split('/').filter(|p| !p.is_empty()).collect(),
        None => Vec::new(),
    };
    for part in href.split('/') {
        match part {
            "" | "." => {}
            ".." => {
                parts.pop();
            }
            other => parts.push(other),
        }
    }
    parts.join("/")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::archive::MemoryArchive;

    const CONTAINER: &str = r#"<?xml version="1.0"?>
<container version="1.0" xmlns="urn:oasis:names:tc:opendocument:xmlns:container">
  <rootfiles>
    <rootfile full-path="content.opf" media-type="application/oebps-package+xml"/>
  </rootfiles>
</container>"#;

    const PACKAGE: &str = r#"<?xml version="1.0"?>
<package xmlns="http://www.idpf.org/2007/opf" version="2.0">
  <manifest>
    <item id="ncx" href="toc.ncx" media-type="application/x-dtbncx+xml"/>
    <item id="c1" href="ch1.html" media-type="application/xhtml+xml"/>
  </manifest>
  <spine toc="ncx"><itemref idref="c1"/></spine>
</package>"#;

    const NCX: &str = r#"<?xml version="1.0"?>
<ncx xmlns="http://www.daisy.org/z3986/2005/ncx/">
  <navMap>
    <navPoint id="p3" class="chapter" playOrder="3">
      <navLabel><text> Third </text></navLabel>
      <content src="ch3.html#start"/>
    </navPoint>
    <navPoint id="p0" class="cover" playOrder="0">
      <navLabel><text>Cover</text></navLabel>
      <content src="cover.html"/>
    </navPoint>
    <navPoint id="p1" class="chapter" playOrder="1">
      <navLabel><text>First</text></navLabel>
      <content src="ch1.html?v=2"/>
    </navPoint>
  </navMap>
</ncx>"#;

    fn sample_archive() -> MemoryArchive {
        MemoryArchive::new()
            .with_entry("META-INF/container.xml", CONTAINER)
            .with_entry("content.opf", PACKAGE)
            .with_entry("toc.ncx", NCX)
    }

    #[test]
    fn keeps_only_chapters_in_document_order() {
        let chapters = resolve_chapters(&mut sample_archive()).unwrap();
        assert_eq!(chapters.len(), 2);
        assert_eq!(chapters[0].source_entry_path, "ch3.html");
        assert_eq!(chapters[0].fragment_id, "start");
        assert_eq!(chapters[0].label, "Third");
        assert_eq!(chapters[0].play_order, 3);
        assert_eq!(chapters[1].source_entry_path, "ch1.html");
        assert_eq!(chapters[1].fragment_id, "");
        assert_eq!(chapters[1].play_order, 1);
    }

    #[test]
    fn container_lookup_ignores_case() {
        let mut archive = MemoryArchive::new()
            .with_entry("meta-inf/CONTAINER.XML", CONTAINER)
            .with_entry("content.opf", PACKAGE)
            .with_entry("toc.ncx", NCX);
        assert_eq!(resolve_chapters(&mut archive).unwrap().len(), 2);
    }

    #[test]
    fn missing_container_is_malformed_archive() {
        let mut archive = MemoryArchive::new().with_entry("content.opf", PACKAGE);
        let err = resolve_chapters(&mut archive).expect_err("no container");
        assert!(matches!(err, BookError::MalformedArchive { .. }));
    }

    #[test]
    fn unknown_toc_id_is_missing_navigation() {
        let package = PACKAGE.replace(r#"toc="ncx""#, r#"toc="nope""#);
        let mut archive = sample_archive().with_entry("content.opf", package);
        let err = resolve_chapters(&mut archive).expect_err("unresolvable toc");
        assert!(matches!(err, BookError::MissingNavigation { .. }));
    }

    #[test]
    fn spine_without_toc_is_missing_navigation() {
        let package = PACKAGE.replace(r#" toc="ncx""#, "");
        let mut archive = sample_archive().with_entry("content.opf", package);
        assert!(matches!(
            resolve_chapters(&mut archive),
            Err(BookError::MissingNavigation { .. })
        ));
    }

    #[test]
    fn hrefs_resolve_relative_to_declaring_document() {
        let container = CONTAINER.replace("content.opf", "OEBPS/content.opf");
        let package = PACKAGE.replace("href=\"toc.ncx\"", "href=\"nav/toc.ncx\"");
        let ncx = NCX.replace("ch3.html", "../text/ch3.html");
        let mut archive = MemoryArchive::new()
            .with_entry("META-INF/container.xml", container)
            .with_entry("OEBPS/content.opf", package)
            .with_entry("OEBPS/nav/toc.ncx", ncx);
        let chapters = resolve_chapters(&mut archive).unwrap();
        assert_eq!(chapters[0].source_entry_path, "OEBPS/text/ch3.html");
        assert_eq!(chapters[1].source_entry_path, "OEBPS/nav/ch1.html");
    }

    #[test]
    fn split_src_strips_query_and_fragment() {
        assert_eq!(split_src("a.html?x=1#frag#more"), ("a.html", "frag#more"));
        assert_eq!(split_src("a.html"), ("a.html", ""));
    }
}
