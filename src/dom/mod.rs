//! Page-to-text reduction: owned DOM snapshots, element tagging and HTML shrinking.
//!
//! The live page is only ever touched to stamp identifier attributes
//! ([`tag_all_elements`]) and to read its HTML. Everything else works on an
//! owned [`Document`] snapshot parsed with `scraper`.

mod reducer;
mod tagger;

pub use reducer::{
    finish_html, reduce, reduce_html, reduce_to_html, shrink_page, ReduceConfig, LABEL_ANCESTOR_DEPTH,
    WHITELIST_ATTRIBUTES_WEB_AUTOMATION, WHITELIST_TAGS_WEB_AUTOMATION,
};
pub use tagger::{tag_all_elements, tag_document};

use scraper::{ElementRef, Html, Node as HtmlNode};

/// JavaScript returning the page's current HTML, doctype included.
pub(crate) const PAGE_CONTENT_JS: &str = r#"(() => {
    const dt = document.doctype;
    return (dt ? '<!DOCTYPE ' + dt.name + '>' : '') + document.documentElement.outerHTML;
})()"#;

/// Elements that never have children or a closing tag.
const VOID_ELEMENTS: &[&str] = &[
    "area", "base", "basefont", "bgsound", "br", "col", "embed", "frame", "hr", "img", "input",
    "keygen", "link", "meta", "param", "source", "track", "wbr",
];

/// Elements whose text content is serialized verbatim.
const RAW_TEXT_ELEMENTS: &[&str] = &[
    "style", "script", "xmp", "iframe", "noembed", "noframes", "plaintext", "noscript",
];

/// An owned snapshot of a parsed HTML document.
#[derive(Debug, Clone, PartialEq)]
pub struct Document {
    /// Doctype name (`html` for `<!DOCTYPE html>`), if the source had one.
    pub doctype: Option<String>,
    /// The document root (`<html>`).
    pub root: Element,
}

/// An element with its attributes in source order.
#[derive(Debug, Clone, PartialEq)]
pub struct Element {
    pub name: String,
    pub attrs: Vec<(String, String)>,
    pub children: Vec<Node>,
}

/// A node in the snapshot tree.
#[derive(Debug, Clone, PartialEq)]
pub enum Node {
    Element(Element),
    Text(String),
    Comment(String),
}

impl Document {
    /// Parse an HTML document. Missing `html`/`head`/`body` are synthesized
    /// the way a browser would.
    pub fn parse(source: &str) -> Self {
        let html = Html::parse_document(source);
        let doctype = html
            .tree
            .root()
            .children()
            .find_map(|node| match node.value() {
                HtmlNode::Doctype(doctype) => Some(doctype.name().to_string()),
                _ => None,
            });
        Self {
            doctype,
            root: Element::from_ref(html.root_element()),
        }
    }

    /// Serialize back to HTML.
    pub fn to_html(&self) -> String {
        let mut out = String::new();
        if let Some(ref name) = self.doctype {
            out.push_str("<!DOCTYPE ");
            out.push_str(name);
            out.push('>');
        }
        self.root.write_html(&mut out);
        out
    }

    /// All elements in document order, root first.
    pub fn elements(&self) -> Vec<&Element> {
        let mut out = Vec::new();
        self.root.collect_elements(&mut out);
        out
    }

    /// First element carrying `name="value"`.
    pub fn find_by_attr(&self, name: &str, value: &str) -> Option<&Element> {
        self.elements()
            .into_iter()
            .find(|el| el.attr(name) == Some(value))
    }
}

impl Element {
    fn from_ref(element: ElementRef<'_>) -> Self {
        let value = element.value();
        let children = element
            .children()
            .filter_map(|child| match child.value() {
                HtmlNode::Element(_) => {
                    ElementRef::wrap(child).map(|el| Node::Element(Self::from_ref(el)))
                }
                HtmlNode::Text(text) => Some(Node::Text(text.to_string())),
                HtmlNode::Comment(comment) => Some(Node::Comment(comment.to_string())),
                _ => None,
            })
            .collect();
        Self {
            name: value.name().to_string(),
            attrs: value
                .attrs()
                .map(|(name, value)| (name.to_string(), value.to_string()))
                .collect(),
            children,
        }
    }

    /// Attribute value by name.
    pub fn attr(&self, name: &str) -> Option<&str> {
        self.attrs
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v.as_str())
    }

    /// Set an attribute, replacing an existing value in place.
    pub fn set_attr(&mut self, name: &str, value: impl Into<String>) {
        let value = value.into();
        match self.attrs.iter_mut().find(|(n, _)| n == name) {
            Some(slot) => slot.1 = value,
            None => self.attrs.push((name.to_string(), value)),
        }
    }

    /// Concatenated text of the direct text children only.
    pub fn own_text(&self) -> String {
        self.children
            .iter()
            .filter_map(|child| match child {
                Node::Text(text) => Some(text.as_str()),
                _ => None,
            })
            .collect()
    }

    /// Full text content, descendants included.
    pub fn text_content(&self) -> String {
        let mut out = String::new();
        self.push_text(&mut out);
        out
    }

    fn push_text(&self, out: &mut String) {
        for child in &self.children {
            match child {
                Node::Text(text) => out.push_str(text),
                Node::Element(el) => el.push_text(out),
                Node::Comment(_) => {}
            }
        }
    }

    fn collect_elements<'a>(&'a self, out: &mut Vec<&'a Element>) {
        out.push(self);
        for child in &self.children {
            if let Node::Element(el) = child {
                el.collect_elements(out);
            }
        }
    }

    fn write_html(&self, out: &mut String) {
        out.push('<');
        out.push_str(&self.name);
        for (name, value) in &self.attrs {
            out.push(' ');
            out.push_str(name);
            out.push_str("=\"");
            escape_into(value, true, out);
            out.push('"');
        }
        out.push('>');
        if VOID_ELEMENTS.contains(&self.name.as_str()) {
            return;
        }
        let raw = RAW_TEXT_ELEMENTS.contains(&self.name.as_str());
        // The parser drops one leading newline in these, so write it twice.
        if matches!(self.name.as_str(), "pre" | "textarea" | "listing") {
            if let Some(Node::Text(text)) = self.children.first() {
                if text.starts_with('\n') {
                    out.push('\n');
                }
            }
        }
        for child in &self.children {
            match child {
                Node::Element(el) => el.write_html(out),
                Node::Text(text) if raw => out.push_str(text),
                Node::Text(text) => escape_into(text, false, out),
                Node::Comment(comment) => {
                    out.push_str("<!--");
                    out.push_str(comment);
                    out.push_str("-->");
                }
            }
        }
        out.push_str("</");
        out.push_str(&self.name);
        out.push('>');
    }
}

fn escape_into(text: &str, attribute: bool, out: &mut String) {
    for c in text.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '\u{a0}' => out.push_str("&nbsp;"),
            '"' if attribute => out.push_str("&quot;"),
            '<' if !attribute => out.push_str("&lt;"),
            '>' if !attribute => out.push_str("&gt;"),
            c => out.push(c),
        }
    }
}
