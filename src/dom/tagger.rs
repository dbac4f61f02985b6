//! Element tagging: stamp every element with a small integer identifier.
//!
//! Identifiers equal the element's index in a document-order walk of all
//! elements (the root is index 0 and is never tagged). Elements that already
//! carry a non-empty identifier keep it. A new element whose index is already
//! taken by an older element gets the next unused number counting up from the
//! element count, so fresh ids never collide with indexes of the current walk.

use std::collections::HashSet;

use eoka::Page;
use tracing::debug;

use super::{Document, Element, Node};
use crate::Result;

const TAG_ELEMENTS_JS: &str = r#"
((attrName) => {
    const elements = document.querySelectorAll('*');
    const used = new Set();
    for (let i = 1; i < elements.length; i++) {
        const id = parseInt(elements[i].getAttribute(attrName), 10);
        if (!Number.isNaN(id)) used.add(id);
    }
    let next = elements.length;
    let tagged = 0;
    for (let i = 1; i < elements.length; i++) {
        if (elements[i].getAttribute(attrName)) continue;
        let id = i;
        if (used.has(id)) {
            while (used.has(next)) next++;
            id = next;
        }
        used.add(id);
        elements[i].setAttribute(attrName, String(id));
        tagged++;
    }
    return tagged;
})
"#;

/// Tag every element on the live page that does not carry `attribute` yet.
pub async fn tag_all_elements(page: &Page, attribute: &str) -> Result<()> {
    let js = format!(
        "{}({})",
        TAG_ELEMENTS_JS.trim(),
        serde_json::to_string(attribute)?
    );
    let tagged: u64 = page.evaluate(&js).await?;
    debug!(tagged, attribute, "tagged elements");
    Ok(())
}

/// Tag a parsed snapshot with the same rules as [`tag_all_elements`].
/// Returns the number of newly tagged elements.
pub fn tag_document(document: &mut Document, attribute: &str) -> usize {
    let mut used = HashSet::new();
    let mut total = 0;
    collect_ids(&document.root, attribute, &mut used, &mut total);

    let mut tagger = Tagger {
        attribute,
        used,
        index: 0,
        next: total,
        tagged: 0,
    };
    tagger.visit(&mut document.root);
    tagger.tagged
}

fn collect_ids(element: &Element, attribute: &str, used: &mut HashSet<u64>, total: &mut u64) {
    if *total > 0 {
        if let Some(id) = element.attr(attribute).and_then(|v| v.trim().parse().ok()) {
            used.insert(id);
        }
    }
    *total += 1;
    for child in &element.children {
        if let Node::Element(el) = child {
            collect_ids(el, attribute, used, total);
        }
    }
}

struct Tagger<'a> {
    attribute: &'a str,
    used: HashSet<u64>,
    index: u64,
    next: u64,
    tagged: usize,
}

impl Tagger<'_> {
    fn visit(&mut self, element: &mut Element) {
        let index = self.index;
        self.index += 1;
        let untagged = element.attr(self.attribute).is_none_or(str::is_empty);
        if index > 0 && untagged {
            let id = if self.used.contains(&index) {
                while self.used.contains(&self.next) {
                    self.next += 1;
                }
                self.next
            } else {
                index
            };
            self.used.insert(id);
            element.set_attr(self.attribute, id.to_string());
            self.tagged += 1;
        }
        for child in &mut element.children {
            if let Node::Element(el) = child {
                self.visit(el);
            }
        }
    }
}
