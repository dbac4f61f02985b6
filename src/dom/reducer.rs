//! Whitelist-based HTML reduction.

use std::collections::HashSet;
use std::sync::LazyLock;

use eoka::Page;
use regex::Regex;

use super::{Document, Element, Node, PAGE_CONTENT_JS};
use crate::{Result, UNIQUE_ID_ATTRIBUTE};

/// Tags kept by default: document structure, text blocks, tables and controls.
pub const WHITELIST_TAGS_WEB_AUTOMATION: &[&str] = &[
    "html", "body", "title", "main", "footer", "header", "nav", "section", "article", "div", "p",
    "span", "h1", "h2", "h3", "h4", "h5", "h6", "table", "thead", "tbody", "tr", "th", "td", "a",
    "button", "form", "input", "label", "select", "option", "textarea",
];

/// Attributes kept by default on whitelisted tags.
pub const WHITELIST_ATTRIBUTES_WEB_AUTOMATION: &[&str] = &[UNIQUE_ID_ATTRIBUTE, "href", "alt"];

/// How many ancestors of a stripped element are searched for a link or button
/// before its direct text is dropped. Deeper decorative nesting loses its label.
pub const LABEL_ANCESTOR_DEPTH: usize = 3;

/// Upper bound on reparse-and-reduce rounds in [`reduce_to_html`].
const MAX_REDUCE_PASSES: usize = 4;

static COMMENT_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)<!--.*?-->").expect("valid comment regex"));
static SPACES_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\s{2,}").expect("valid whitespace regex"));
static BETWEEN_TAGS_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r">\s+<").expect("valid tag gap regex"));

/// Tags and attributes that survive reduction. Names are matched lowercase.
#[derive(Debug, Clone, PartialEq)]
pub struct ReduceConfig {
    pub tags: HashSet<String>,
    pub attributes: HashSet<String>,
}

impl ReduceConfig {
    /// Build a config. The identifier attribute is always whitelisted.
    pub fn new<T, A>(tags: T, attributes: A) -> Self
    where
        T: IntoIterator,
        T::Item: AsRef<str>,
        A: IntoIterator,
        A::Item: AsRef<str>,
    {
        let tags = tags
            .into_iter()
            .map(|t| t.as_ref().to_ascii_lowercase())
            .collect();
        let mut attributes: HashSet<String> = attributes
            .into_iter()
            .map(|a| a.as_ref().to_ascii_lowercase())
            .collect();
        attributes.insert(UNIQUE_ID_ATTRIBUTE.to_string());
        Self { tags, attributes }
    }

    fn keeps_tag(&self, name: &str) -> bool {
        self.tags.contains(&name.to_ascii_lowercase())
    }

    fn keeps_attribute(&self, name: &str) -> bool {
        self.attributes.contains(&name.to_ascii_lowercase())
    }
}

impl Default for ReduceConfig {
    fn default() -> Self {
        Self::new(
            WHITELIST_TAGS_WEB_AUTOMATION,
            WHITELIST_ATTRIBUTES_WEB_AUTOMATION,
        )
    }
}

/// Reduce a snapshot to whitelisted tags and attributes.
///
/// Every element below the root is processed after all of its descendants,
/// which is the same as walking document order backwards. A whitelisted
/// element keeps only whitelisted attributes. Any other element is replaced by
/// its element children; its direct text survives only when a link or button
/// sits within [`LABEL_ANCESTOR_DEPTH`] ancestors, in which case the text goes
/// in front of the hoisted children. The root keeps its attributes.
pub fn reduce(document: &Document, config: &ReduceConfig) -> Document {
    let mut root = document.root.clone();
    let mut ancestors = vec![root.name.to_ascii_lowercase()];
    let children = std::mem::take(&mut root.children);
    root.children = reduce_nodes(children, config, &mut ancestors);
    Document {
        doctype: document.doctype.clone(),
        root,
    }
}

fn reduce_nodes(nodes: Vec<Node>, config: &ReduceConfig, ancestors: &mut Vec<String>) -> Vec<Node> {
    let mut out = Vec::with_capacity(nodes.len());
    for node in nodes {
        match node {
            Node::Element(element) => out.extend(reduce_element(element, config, ancestors)),
            other => out.push(other),
        }
    }
    out
}

fn reduce_element(
    mut element: Element,
    config: &ReduceConfig,
    ancestors: &mut Vec<String>,
) -> Vec<Node> {
    ancestors.push(element.name.to_ascii_lowercase());
    let children = std::mem::take(&mut element.children);
    element.children = reduce_nodes(children, config, ancestors);
    ancestors.pop();

    if config.keeps_tag(&element.name) {
        element.attrs.retain(|(name, _)| config.keeps_attribute(name));
        return vec![Node::Element(element)];
    }

    let mut hoisted = Vec::with_capacity(element.children.len() + 1);
    let text = element.own_text();
    if !text.trim().is_empty() && inside_control(ancestors) {
        hoisted.push(Node::Text(text));
    }
    hoisted.extend(
        element
            .children
            .into_iter()
            .filter(|child| matches!(child, Node::Element(_))),
    );
    hoisted
}

fn inside_control(ancestors: &[String]) -> bool {
    ancestors
        .iter()
        .rev()
        .take(LABEL_ANCESTOR_DEPTH)
        .any(|name| name == "a" || name == "button")
}

/// Normalize serialized HTML: drop comments, collapse whitespace runs and
/// remove whitespace between tags.
pub fn finish_html(html: &str) -> String {
    let html = COMMENT_RE.replace_all(html, "");
    let html = SPACES_RE.replace_all(&html, " ");
    BETWEEN_TAGS_RE.replace_all(&html, "><").into_owned()
}

/// Parse, reduce and normalize an HTML string.
pub fn reduce_html(html: &str, config: &ReduceConfig) -> String {
    reduce_to_html(&Document::parse(html), config)
}

/// Reduce a snapshot and serialize it. Hoisting can leave structure the
/// parser rebuilds differently (a bare `<tr>` under `<table>`, nested
/// headings), so the output is reparsed and reduced again until it stops
/// changing.
pub fn reduce_to_html(document: &Document, config: &ReduceConfig) -> String {
    let mut out = finish_html(&reduce(document, config).to_html());
    for _ in 1..MAX_REDUCE_PASSES {
        let next = finish_html(&reduce(&Document::parse(&out), config).to_html());
        if next == out {
            break;
        }
        out = next;
    }
    out
}

/// Read the live page's HTML and reduce it.
pub async fn shrink_page(page: &Page, config: &ReduceConfig) -> Result<String> {
    let html: String = page.evaluate(PAGE_CONTENT_JS).await?;
    Ok(reduce_html(&html, config))
}

#[cfg(test)]
mod tests {
    use super::*;

    const DUMMY_HTML: &str = r#"<!DOCTYPE html>
<html lang="en">
<head>
    <meta charset="UTF-8">
    <meta name="viewport" content="width=device-width, initial-scale=1.0">
    <title>Page live view</title>
    <!--  Ensures page refresh every 1 sec  -->
     <meta http-equiv="refresh" content="1">
</head>
<body>
   <img src="test.jpg" />
</body>
</html>"#;

    const SHOP_HTML: &str = r#"<!DOCTYPE html>
<html>
<head><title>Shop</title><style>p { color: red; }</style></head>
<body class="home">
  <header><nav><ul>
    <li><a href="/home" class="nav-link">Home</a></li>
    <li><a href="/cart"><i class="icon"></i><em>Cart</em></a></li>
  </ul></nav></header>
  <main>
    <h1 id="title">Products</h1>
    <table><tr><th>Name</th><td>Tea &amp; cakes</td></tr></table>
    <form action="/search">
      <label>Query <input name="q" type="text"></label>
      <button type="submit"><strong>Search</strong></button>
      <select name="sort"><option value="1">Newest</option></select>
    </form>
    <p>Some    text<br>continues <!-- note --> here</p>
    <img src="x.png" alt="Logo">
  </main>
  <footer><p>&copy; 2024</p></footer>
  <script>var a = "<!-- not a comment -->";</script>
</body>
</html>"#;

    #[test]
    fn test_reduces_to_expected_html() {
        let html = r#"<!DOCTYPE html>
<html lang="en">
<head>
    <meta charset="UTF-8">
    <meta name="viewport" content="width=device-width, initial-scale=1.0">
    <title>Page live view</title>
    <!--  Ensures page refresh every 1 sec  -->
     <meta http-equiv="refresh" content="1">
</head>
<body>
   <!-- Comments should be removed -->
   <img src="test.jpg" />
   <a href="https://book.agenda.ch/services?companyId=6505"><span><font><font>See you online!</font></font></span></a>
</body>
</html>"#;
        let expected = r#"<!DOCTYPE html><html lang="en"><title>Page live view</title><body><a href="https://book.agenda.ch/services?companyId=6505"><span>See you online!</span></a></body></html>"#;
        assert_eq!(reduce_html(html, &ReduceConfig::default()), expected);
    }

    #[test]
    fn test_reduce_is_idempotent() {
        let config = ReduceConfig::default();
        for html in [
            DUMMY_HTML,
            SHOP_HTML,
            "<table><tbody><tr><td>a</td></tr></tbody><tfoot><tr><td>Total</td></tr></tfoot></table>",
            "<h1><ul><li><h2>Sub</h2></li></ul></h1>",
            "<p><ul><li>item</li></ul></p><table><caption>c</caption><tr><td>x</td></tr></table>",
        ] {
            let once = reduce_html(html, &config);
            let twice = reduce_html(&once, &config);
            assert_eq!(once, twice, "input: {}", html);
        }
    }

    #[test]
    fn test_hoisted_table_rows_settle() {
        let html = "<table><tbody><tr><td>a</td></tr></tbody><tfoot><tr><td>Total</td></tr></tfoot></table>";
        let out = reduce_html(html, &ReduceConfig::default());
        assert!(
            out.contains("</tbody><tbody><tr><td>Total</td></tr></tbody></table>"),
            "{}",
            out
        );
    }

    #[test]
    fn test_nested_headings_settle() {
        let out = reduce_html("<h1><ul><li><h2>Sub</h2></li></ul></h1>", &ReduceConfig::default());
        assert!(out.contains("<h1></h1><h2>Sub</h2>"), "{}", out);
    }

    #[test]
    fn test_label_text_moves_up_to_link() {
        let html = r#"<body><a href="x"><span><b>Label</b></span></a></body>"#;
        let out = reduce_html(html, &ReduceConfig::default());
        assert!(out.contains(r#"<a href="x"><span>Label</span></a>"#), "{}", out);
    }

    #[test]
    fn test_button_label_survives() {
        let out = reduce_html(SHOP_HTML, &ReduceConfig::default());
        assert!(out.contains("<button>Search</button>"), "{}", out);
        assert!(out.contains(r#"<a href="/cart">Cart</a>"#), "{}", out);
        assert!(out.contains(r#"<a href="/home">Home</a>"#), "{}", out);
    }

    #[test]
    fn test_label_depth_is_bounded() {
        let html = r#"<body><a href="x"><i><i><i><i>Deep</i></i></i></i></a></body>"#;
        let out = reduce_html(html, &ReduceConfig::default());
        assert!(!out.contains("Deep"), "{}", out);
        assert!(out.contains(r#"<a href="x"></a>"#), "{}", out);
    }

    #[test]
    fn test_text_outside_controls_is_dropped() {
        let html = "<body><div><em>gone</em><p>kept</p></div></body>";
        let out = reduce_html(html, &ReduceConfig::default());
        assert!(!out.contains("gone"));
        assert!(out.contains("<div><p>kept</p></div>"), "{}", out);
    }

    #[test]
    fn test_whitelist_soundness() {
        let config = ReduceConfig::default();
        let reduced = reduce(&Document::parse(SHOP_HTML), &config);
        for element in reduced.elements().into_iter().skip(1) {
            assert!(config.tags.contains(&element.name), "tag {}", element.name);
            for (name, _) in &element.attrs {
                assert!(config.attributes.contains(name), "attribute {}", name);
            }
        }
    }

    #[test]
    fn test_comments_removed() {
        let out = reduce_html(SHOP_HTML, &ReduceConfig::default());
        assert!(!out.contains("<!--"), "{}", out);
        assert!(!out.contains("script"));
        assert!(out.contains("<p>Some textcontinues here</p>"), "{}", out);
    }

    #[test]
    fn test_keeps_identifier_attribute() {
        let html = r#"<body><div gid="4" class="c"><img src="x"><p gid="5" style="s">t</p></div></body>"#;
        let out = reduce_html(html, &ReduceConfig::default());
        assert!(out.contains(r#"<div gid="4"><p gid="5">t</p></div>"#), "{}", out);
    }

    #[test]
    fn test_config_normalizes_names() {
        let config = ReduceConfig::new(["DIV", "Body"], ["HREF"]);
        assert!(config.keeps_tag("div"));
        assert!(config.keeps_tag("BODY"));
        assert!(config.keeps_attribute("href"));
        assert!(config.keeps_attribute(UNIQUE_ID_ATTRIBUTE));
        assert!(!config.keeps_attribute("alt"));
    }

    #[test]
    fn test_finish_html() {
        assert_eq!(
            finish_html("<p>a  \n b</p>\n  <!-- c -->\n<div> </div>"),
            "<p>a b</p><div></div>"
        );
    }
}
