use eoka::Page;
use tracing::info;

use crate::agent::{redact_after_marker, StepRewrite};
use crate::dom::{shrink_page, tag_all_elements, ReduceConfig};
use crate::tokens::TokenCounter;
use crate::{ObservationConfig, Result, UNIQUE_ID_ATTRIBUTE};

/// Marks where the page snapshot starts in an observation.
pub const CURRENT_PAGE_PREFIX: &str = "Current page content:";

/// Stands in for a page snapshot that is no longer the latest one.
pub const PREVIOUS_PAGE_OMITTED: &str = " [content of the previous page omitted]";

/// Turns the live page into a clipped observation.
#[derive(Debug)]
pub struct PageObserver {
    reduce: ReduceConfig,
    tokens: TokenCounter,
    max_tokens: usize,
}

impl PageObserver {
    pub fn new(reduce: ReduceConfig, max_tokens: usize) -> Result<Self> {
        Ok(Self {
            reduce,
            tokens: TokenCounter::new()?,
            max_tokens,
        })
    }

    pub fn from_config(config: &ObservationConfig) -> Result<Self> {
        Self::new(config.reduce_config(), config.max_tokens)
    }

    /// Tag the page, reduce it and format the result for `action_name`.
    pub async fn observe(&self, page: &Page, action_name: &str) -> Result<String> {
        tag_all_elements(page, UNIQUE_ID_ATTRIBUTE).await?;
        let html = shrink_page(page, &self.reduce).await?;
        let url = page.url().await?;
        info!(url = %url, html_length = html.len(), "{} done", action_name);
        Ok(self.format(action_name, &html))
    }

    /// `Previous action was: <name>, Current page content: <html>`, clipped.
    pub fn format(&self, action_name: &str, html: &str) -> String {
        let text = format!(
            "Previous action was: {}, {} {}",
            action_name, CURRENT_PAGE_PREFIX, html
        );
        self.tokens.clip(&text, self.max_tokens).to_string()
    }

    /// Step rewrite that drops the page snapshot from older observations.
    pub fn redact_previous_page() -> StepRewrite {
        redact_after_marker(CURRENT_PAGE_PREFIX, PREVIOUS_PAGE_OMITTED)
    }
}
