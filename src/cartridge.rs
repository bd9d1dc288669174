//! IMS Common Cartridge (`.imscc`) manifest extraction.
//!
//! A cartridge is a zip archive whose structure is described by an
//! `imsmanifest.xml`. The extractor finds that manifest, parses it into a
//! normalized [`XmlNode`] tree and resolves a human-readable course title.
//!
//! # Title resolution
//!
//! Title lookup is the ordered table [`TITLE_STRATEGIES`]; the first
//! strategy producing a non-blank value wins:
//!
//! 1. `lom_namespaced`: `metadata/lomimscc:lom/lomimscc:general/lomimscc:title/lomimscc:string`
//!    (any prefix, as long as one is present)
//! 2. `lom_unprefixed`: the same path written without prefixes (default namespace)
//! 3. `first_organization`: the first organization's title, else the first
//!    titled item in its hierarchy
//!
//! No match leaves the title unset; there is no placeholder.

use std::io::Cursor;

use serde::Serialize;
use tracing::{debug, warn};

use crate::extract::{read_zip_entry_bounded, ExtractError, MAX_ZIP_ENTRY_BYTES};
use crate::models::{ParseResult, ParsedContent};
use crate::xml::{parse_document, XmlNode};

/// File name of the cartridge manifest, matched case-insensitively.
pub const MANIFEST_FILE_NAME: &str = "imsmanifest.xml";

/// A named title lookup over a manifest root.
pub type TitleStrategy = fn(&XmlNode) -> Option<String>;

/// Title lookups in priority order.
pub const TITLE_STRATEGIES: &[(&str, TitleStrategy)] = &[
    ("lom_namespaced", lom_title_namespaced),
    ("lom_unprefixed", lom_title_unprefixed),
    ("first_organization", first_organization_title),
];

const LOM_PATH: &[&str] = &["lom", "general", "title", "string"];

/// Extracts a cartridge, degrading any failure to `None`.
pub fn extract_cartridge(bytes: &[u8]) -> Option<ParseResult> {
    match try_extract_cartridge(bytes) {
        Ok(result) => Some(result),
        Err(e) => {
            warn!(error = %e, "cartridge extraction failed");
            None
        }
    }
}

/// Extracts a cartridge, returning the typed failure.
pub fn try_extract_cartridge(bytes: &[u8]) -> Result<ParseResult, ExtractError> {
    let mut archive = zip::ZipArchive::new(Cursor::new(bytes))?;
    let manifest_name = {
        let names: Vec<&str> = archive.file_names().collect();
        find_manifest_entry(&names)
            .ok_or(ExtractError::ManifestNotFound)?
            .to_string()
    };
    debug!(entry = manifest_name.as_str(), "found cartridge manifest");

    let xml = read_zip_entry_bounded(&mut archive, &manifest_name, MAX_ZIP_ENTRY_BYTES)?;
    let manifest = parse_document(&xml)?;
    let title = resolve_title(&manifest);

    Ok(ParseResult {
        content: ParsedContent::Manifest(manifest),
        title,
        metadata: None,
    })
}

/// Picks the manifest among archive entry names.
///
/// Directory entries, `__MACOSX/` resource forks and AppleDouble `._*`
/// shadow files never qualify. The shallowest match wins; ties keep
/// archive order.
pub fn find_manifest_entry<'a>(names: &[&'a str]) -> Option<&'a str> {
    names
        .iter()
        .copied()
        .filter(|name| is_manifest_path(name))
        .min_by_key(|name| name.matches('/').count())
}

fn is_manifest_path(name: &str) -> bool {
    let lower = name.to_ascii_lowercase();
    if lower.ends_with('/') {
        return false;
    }
    let mut components = lower.split('/');
    if components.any(|c| c == "__macosx") {
        return false;
    }
    let file = lower.rsplit('/').next().unwrap_or_default();
    if file.starts_with("._") {
        return false;
    }
    file == MANIFEST_FILE_NAME
}

/// Runs [`TITLE_STRATEGIES`] in order; first non-blank trimmed value wins.
pub fn resolve_title(manifest: &XmlNode) -> Option<String> {
    TITLE_STRATEGIES.iter().find_map(|(name, strategy)| {
        let title = strategy(manifest)
            .map(|t| t.trim().to_string())
            .filter(|t| !t.is_empty())?;
        debug!(strategy = *name, title = title.as_str(), "resolved cartridge title");
        Some(title)
    })
}

fn lom_title_namespaced(manifest: &XmlNode) -> Option<String> {
    lom_title(manifest, |node, local| node.prefix().is_some() && node.local_name() == local)
}

fn lom_title_unprefixed(manifest: &XmlNode) -> Option<String> {
    lom_title(manifest, |node, local| node.name == local)
}

fn lom_title(manifest: &XmlNode, matches: fn(&XmlNode, &str) -> bool) -> Option<String> {
    let metadata = manifest.child_local("metadata")?;
    let mut node = metadata;
    for (depth, step) in LOM_PATH.iter().enumerate() {
        match node.children.iter().find(|c| matches(c, step)) {
            Some(next) => node = next,
            // Some exporters put the text straight into <title>.
            None if depth == LOM_PATH.len() - 1 => return node.text().map(str::to_string),
            None => return None,
        }
    }
    node.text().map(str::to_string)
}

fn first_organization_title(manifest: &XmlNode) -> Option<String> {
    let organization = manifest
        .child_local("organizations")?
        .child_local("organization")?;
    if let Some(title) = organization.child_local("title").and_then(XmlNode::text) {
        return Some(title.to_string());
    }
    organization
        .find_descendant(&|n| {
            n.local_name() == "item" && n.child_local("title").and_then(XmlNode::text).is_some()
        })
        .and_then(|item| item.child_local("title"))
        .and_then(XmlNode::text)
        .map(str::to_string)
}

/// One entry of a flattened course hierarchy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OutlineItem {
    /// 0 for top-level units.
    pub depth: usize,
    pub title: String,
    /// The resource this item points to, if any.
    pub identifier_ref: Option<String>,
}

/// Flattens the first organization's item tree in document order.
///
/// The untitled wrapper item most cartridges use as the organization root
/// is skipped without consuming a depth level.
pub fn outline(manifest: &XmlNode) -> Vec<OutlineItem> {
    let mut items = Vec::new();
    let Some(organization) = manifest
        .child_local("organizations")
        .and_then(|o| o.child_local("organization"))
    else {
        return items;
    };
    for item in organization.children_local("item") {
        walk_items(item, 0, &mut items);
    }
    items
}

fn walk_items(item: &XmlNode, depth: usize, out: &mut Vec<OutlineItem>) {
    let title = item.child_local("title").and_then(XmlNode::text);
    let child_depth = match title {
        Some(title) => {
            out.push(OutlineItem {
                depth,
                title: title.to_string(),
                identifier_ref: item.attribute("identifierref").map(str::to_string),
            });
            depth + 1
        }
        None => depth,
    };
    for child in item.children_local("item") {
        walk_items(child, child_depth, out);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manifest(xml: &str) -> XmlNode {
        parse_document(xml.as_bytes()).unwrap()
    }

    const ORGS: &str = r#"
        <organizations>
          <organization identifier="org_1" structure="rooted-hierarchy">
            <item identifier="root">
              <item identifier="u1"><title>  Unit 1: Foundations </title>
                <item identifier="l1" identifierref="res1"><title>Lesson 1</title></item>
              </item>
              <item identifier="u2"><title>Unit 2</title></item>
            </item>
          </organization>
        </organizations>"#;

    #[test]
    fn namespaced_lom_title_wins_over_organization() {
        let m = manifest(&format!(
            r#"<manifest xmlns:lomimscc="urn:lom"><metadata><schema>IMS Common Cartridge</schema>
                <lomimscc:lom><lomimscc:general><lomimscc:title>
                  <lomimscc:string language="en"> Intro to Biology </lomimscc:string>
                </lomimscc:title></lomimscc:general></lomimscc:lom></metadata>{ORGS}</manifest>"#
        ));
        assert_eq!(resolve_title(&m).as_deref(), Some("Intro to Biology"));
    }

    #[test]
    fn unprefixed_lom_title_is_second() {
        let m = manifest(&format!(
            r#"<manifest><metadata><lom xmlns="urn:lom"><general><title>
                <string>Plain Namespace Course</string></title></general></lom></metadata>{ORGS}</manifest>"#
        ));
        assert_eq!(resolve_title(&m).as_deref(), Some("Plain Namespace Course"));
    }

    #[test]
    fn blank_lom_title_falls_through_to_organization() {
        let m = manifest(&format!(
            r#"<manifest><metadata><lom:lom xmlns:lom="x"><lom:general><lom:title>
                <lom:string>   </lom:string></lom:title></lom:general></lom:lom></metadata>{ORGS}</manifest>"#
        ));
        assert_eq!(resolve_title(&m).as_deref(), Some("Unit 1: Foundations"));
    }

    #[test]
    fn organization_own_title_precedes_items() {
        let m = manifest(
            r#"<manifest><organizations><organization><title>Course Map</title>
                <item><item><title>Unit A</title></item></item></organization></organizations></manifest>"#,
        );
        assert_eq!(resolve_title(&m).as_deref(), Some("Course Map"));
    }

    #[test]
    fn no_title_anywhere_is_none() {
        let m = manifest(r#"<manifest><metadata/><resources/></manifest>"#);
        assert_eq!(resolve_title(&m), None);
    }

    #[test]
    fn strategy_order_is_fixed() {
        let names: Vec<&str> = TITLE_STRATEGIES.iter().map(|(n, _)| *n).collect();
        assert_eq!(names, ["lom_namespaced", "lom_unprefixed", "first_organization"]);
    }

    #[test]
    fn manifest_entry_skips_platform_junk() {
        let names = [
            "__MACOSX/._imsmanifest.xml",
            "__MACOSX/imsmanifest.xml",
            "course/._imsmanifest.xml",
            "course/IMSManifest.XML",
            "not_imsmanifest.xml",
        ];
        assert_eq!(find_manifest_entry(&names), Some("course/IMSManifest.XML"));
    }

    #[test]
    fn shallowest_manifest_wins() {
        let names = ["deep/nested/imsmanifest.xml", "imsmanifest.xml", "imsmanifest.xml/"];
        assert_eq!(find_manifest_entry(&names), Some("imsmanifest.xml"));
        assert_eq!(find_manifest_entry(&["readme.txt"]), None);
    }

    #[test]
    fn outline_flattens_items_and_skips_wrapper() {
        let m = manifest(&format!("<manifest>{ORGS}</manifest>"));
        let items = outline(&m);
        assert_eq!(
            items,
            vec![
                OutlineItem {
                    depth: 0,
                    title: "Unit 1: Foundations".into(),
                    identifier_ref: None
                },
                OutlineItem {
                    depth: 1,
                    title: "Lesson 1".into(),
                    identifier_ref: Some("res1".into())
                },
                OutlineItem {
                    depth: 0,
                    title: "Unit 2".into(),
                    identifier_ref: None
                },
            ]
        );
    }

    #[test]
    fn garbage_bytes_are_none() {
        assert!(extract_cartridge(b"definitely not a zip").is_none());
    }
}
