use async_trait::async_trait;
use eoka::Page;
use serde_json::{Map, Value};
use tracing::{debug, info, warn};

use super::{
    key_values_to_object, Action, ActionCatalog, ActionKind, CaptureScreenshotParams,
    ClickElementParams, ExtractDataParams, FillFormParams, GoToUrlParams, PageObserver,
    SaveOutputParams, SaveToDatasetParams,
};
use crate::agent::{ToolInfo, Toolbox};
use crate::dom::PAGE_CONTENT_JS;
use crate::store::{Store, OUTPUT_RECORD_KEY};
use crate::{Error, Result, UNIQUE_ID_ATTRIBUTE};

/// How long to wait for the network to settle after an action.
const NAVIGATION_TIMEOUT_MS: u64 = 5000;
const NETWORK_IDLE_MS: u64 = 500;

/// Tag clicked when the model does not name one.
const DEFAULT_CLICK_TAG: &str = "a";

/// Clicks the first visible consent button it recognizes. Returns how many it clicked.
const CLOSE_COOKIE_MODALS_JS: &str = r#"(() => {
    const selectors = [
        '#onetrust-accept-btn-handler',
        '#CybotCookiebotDialogBodyLevelButtonLevelOptinAllowAll',
        '#didomi-notice-agree-button',
        '.cc-allow', '.cc-dismiss',
        '[data-testid="cookie-policy-banner-accept"]',
        'button[aria-label*="accept" i]'
    ];
    const texts = ['accept all', 'accept all cookies', 'allow all', 'i agree', 'agree', 'accept', 'got it', 'ok'];
    const visible = (el) => !!(el.offsetWidth || el.offsetHeight || el.getClientRects().length);
    for (const sel of selectors) {
        const el = document.querySelector(sel);
        if (el && visible(el)) { el.click(); return 1; }
    }
    const candidates = document.querySelectorAll('button, [role="button"], a');
    for (const el of candidates) {
        const text = (el.textContent || '').trim().toLowerCase();
        if (!text || text.length > 30 || !visible(el)) continue;
        const container = el.closest('[id*="cookie" i], [class*="cookie" i], [id*="consent" i], [class*="consent" i], [role="dialog"]');
        if (container && texts.includes(text)) { el.click(); return 1; }
    }
    return 0;
})()"#;

/// Finds the first `tag` element containing `text` and returns a selector by
/// its identifier, tagging it first if needed.
const FIND_BY_TEXT_JS: &str = r#"((tag, text, attr) => {
    const needle = text.trim().toLowerCase();
    for (const el of document.querySelectorAll(tag)) {
        if (!(el.textContent || '').toLowerCase().includes(needle)) continue;
        let id = el.getAttribute(attr);
        if (!id) {
            let max = 0;
            for (const other of document.querySelectorAll('[' + attr + ']')) {
                max = Math.max(max, parseInt(other.getAttribute(attr), 10) || 0);
            }
            id = String(max + 1);
            el.setAttribute(attr, id);
        }
        return tag + '[' + attr + '="' + id + '"]';
    }
    return null;
})"#;

/// What an action may touch: the page, the observer that snapshots it and
/// the store that persists saved data. Nothing from the control loop.
pub struct ActionContext<'a> {
    pub page: &'a Page,
    pub observer: &'a PageObserver,
    pub store: &'a dyn Store,
}

impl Action {
    /// Run the action and return its observation.
    pub async fn execute(&self, ctx: &ActionContext<'_>) -> Result<String> {
        match self {
            Self::GoToUrl(p) => go_to_url(ctx, p).await,
            Self::ClickElement(p) => click_element(ctx, p).await,
            Self::FillFormAndSubmit(p) => fill_form_and_submit(ctx, p).await,
            Self::ExtractData(p) => extract_data(ctx, p).await,
            Self::SaveObjectToOutput(p) => save_output(ctx, p),
            Self::SaveObjectsToDataset(p) => push_to_dataset(ctx, p),
            Self::CaptureAndSaveScreenshot(p) => capture_screenshot(ctx, p).await,
        }
    }
}

async fn go_to_url(ctx: &ActionContext<'_>, params: &GoToUrlParams) -> Result<String> {
    info!(url = %params.url, "going to page");
    ctx.page.goto(&params.url).await?;
    settle(ctx.page).await;
    ctx.observer
        .observe(ctx.page, ActionKind::GoToUrl.name())
        .await
}

async fn click_element(ctx: &ActionContext<'_>, params: &ClickElementParams) -> Result<String> {
    let tag = params
        .tag_name
        .as_deref()
        .filter(|t| !t.is_empty())
        .unwrap_or(DEFAULT_CLICK_TAG)
        .to_ascii_lowercase();
    info!(text = %params.text, gid = params.gid, tag = %tag, "clicking element");

    let mut selector = None;
    let mut found_by_gid = false;
    if params.gid > 0 {
        let by_gid = gid_selector(&tag, params.gid);
        if element_exists(ctx.page, &by_gid).await? {
            selector = Some(by_gid);
            found_by_gid = true;
        }
    }
    if selector.is_none() && !params.text.trim().is_empty() {
        selector = find_by_text(ctx.page, &tag, &params.text).await?;
    }
    let Some(selector) = selector else {
        let url = ctx.page.url().await.unwrap_or_default();
        warn!(
            "cannot find {} with text '{}' or gid {} on {}",
            tag, params.text, params.gid, url
        );
        return Err(Error::ElementNotFound(format!(
            "{} with text '{}' or gid {}",
            tag, params.text, params.gid
        )));
    };

    better_click(ctx.page, &selector).await?;
    settle(ctx.page).await;
    debug!(found_by_gid, "clicked");
    ctx.observer
        .observe(ctx.page, ActionKind::ClickElement.name())
        .await
}

async fn fill_form_and_submit(ctx: &ActionContext<'_>, params: &FillFormParams) -> Result<String> {
    info!(fields = params.form_data.len(), "filling form");
    for field in &params.form_data {
        let selector = format!("[{}=\"{}\"]", UNIQUE_ID_ATTRIBUTE, field.gid);
        if element_exists(ctx.page, &selector).await? {
            ctx.page.fill(&selector, field.value.trim()).await?;
        } else {
            warn!(gid = field.gid, "form field not found, skipping");
        }
    }

    let submit = r#"button[type="submit"]"#;
    if element_exists(ctx.page, submit).await? {
        ctx.page.click(submit).await?;
    } else {
        ctx.page.human().press_key("Enter").await?;
    }
    settle(ctx.page).await;
    ctx.observer
        .observe(ctx.page, ActionKind::FillFormAndSubmit.name())
        .await
}

async fn extract_data(ctx: &ActionContext<'_>, params: &ExtractDataParams) -> Result<String> {
    info!(fields = params.attributes_to_extract.len(), "extracting data");
    let mut data = Map::new();
    for field in &params.attributes_to_extract {
        let js = format!(
            "document.querySelector({})?.textContent ?? null",
            js_string(&format!("[{}=\"{}\"]", UNIQUE_ID_ATTRIBUTE, field.gid))?
        );
        let text: Option<String> = ctx.page.evaluate(&js).await?;
        match text {
            Some(text) => {
                data.insert(field.key_name.clone(), Value::String(text.trim().to_string()));
            }
            None => debug!(gid = field.gid, "nothing to extract"),
        }
    }
    info!(extracted = data.len(), "data extracted from page");
    Ok(format!(
        "Extracted JSON data from page: {}",
        serde_json::to_string(&data)?
    ))
}

fn save_output(ctx: &ActionContext<'_>, params: &SaveOutputParams) -> Result<String> {
    let data = Value::Object(key_values_to_object(&params.object));
    ctx.store.set_value(OUTPUT_RECORD_KEY, &data)?;
    info!(keys = params.object.len(), "output saved");
    Ok("Output saved".to_string())
}

fn push_to_dataset(ctx: &ActionContext<'_>, params: &SaveToDatasetParams) -> Result<String> {
    let items: Vec<Value> = params
        .objects
        .iter()
        .map(|pairs| Value::Object(key_values_to_object(pairs)))
        .collect();
    let total = ctx.store.push_data(&items)?;
    info!(pushed = items.len(), total, "pushed to dataset");
    Ok("Pushed to dataset.".to_string())
}

async fn capture_screenshot(
    ctx: &ActionContext<'_>,
    params: &CaptureScreenshotParams,
) -> Result<String> {
    let key = params
        .filename
        .as_deref()
        .filter(|f| !f.is_empty())
        .unwrap_or("screenshot");
    let png = ctx.page.screenshot().await?;
    let location = ctx.store.set_blob(key, "png", &png)?;
    info!(location = %location, "screenshot saved");
    if params.save_html.unwrap_or(false) {
        let html: String = ctx.page.evaluate(PAGE_CONTENT_JS).await?;
        let location = ctx.store.set_blob(key, "html", html.as_bytes())?;
        info!(location = %location, "html snapshot saved");
    }
    Ok("Screenshot saved".to_string())
}

/// Wait for the page to settle and dismiss cookie dialogs. Never fails.
async fn settle(page: &Page) {
    if let Err(e) = page
        .wait_for_network_idle(NETWORK_IDLE_MS, NAVIGATION_TIMEOUT_MS)
        .await
    {
        debug!("wait for navigation failed: {}", e);
    }
    match page.evaluate::<u32>(CLOSE_COOKIE_MODALS_JS).await {
        Ok(0) => {}
        Ok(clicked) => {
            debug!(clicked, "closed cookie modal");
            page.wait(300).await;
        }
        Err(e) => debug!("closing cookie modals failed: {}", e),
    }
}

/// Click through the DOM and with native input at the same time. One failing
/// is fine; if both fail the click still counts when the page navigated away.
async fn better_click(page: &Page, selector: &str) -> Result<()> {
    let url_before = page.url().await.unwrap_or_default();
    let dom_js = format!("document.querySelector({})?.click()", js_string(selector)?);
    let (dom, native) = tokio::join!(page.execute(&dom_js), page.click(selector));
    match (dom, native) {
        (Ok(()), Ok(())) => Ok(()),
        (Ok(()), Err(e)) | (Err(e), Ok(())) => {
            debug!("one click mechanism failed: {}", e);
            Ok(())
        }
        (Err(dom_err), Err(native_err)) => {
            let url_after = page.url().await.unwrap_or_default();
            if !url_before.is_empty() && url_after != url_before {
                debug!("both clicks reported errors but the page navigated: {}", native_err);
                Ok(())
            } else {
                Err(dom_err.into())
            }
        }
    }
}

async fn element_exists(page: &Page, selector: &str) -> Result<bool> {
    let js = format!("!!document.querySelector({})", js_string(selector)?);
    Ok(page.evaluate(&js).await?)
}

async fn find_by_text(page: &Page, tag: &str, text: &str) -> Result<Option<String>> {
    let js = format!(
        "{}({}, {}, {})",
        FIND_BY_TEXT_JS,
        js_string(tag)?,
        js_string(text)?,
        js_string(UNIQUE_ID_ATTRIBUTE)?
    );
    Ok(page.evaluate(&js).await?)
}

fn gid_selector(tag: &str, gid: u64) -> String {
    format!("{}[{}=\"{}\"]", tag, UNIQUE_ID_ATTRIBUTE, gid)
}

fn js_string(s: &str) -> Result<String> {
    Ok(serde_json::to_string(s)?)
}

/// Runs catalog actions against one page.
pub struct BrowserToolbox<'a> {
    catalog: ActionCatalog,
    context: ActionContext<'a>,
}

impl<'a> BrowserToolbox<'a> {
    pub fn new(page: &'a Page, observer: &'a PageObserver, store: &'a dyn Store) -> Self {
        Self {
            catalog: ActionCatalog::new(),
            context: ActionContext {
                page,
                observer,
                store,
            },
        }
    }

    pub fn catalog(&self) -> &ActionCatalog {
        &self.catalog
    }
}

#[async_trait(?Send)]
impl Toolbox for BrowserToolbox<'_> {
    fn tool(&self, name: &str) -> Option<ToolInfo> {
        self.catalog.get(name).map(|kind| ToolInfo {
            return_direct: kind.return_direct(),
        })
    }

    async fn invoke(&self, name: &str, input: &Value) -> Result<String> {
        let kind = self.catalog.get(name).ok_or_else(|| Error::ToolInput {
            tool: name.to_string(),
            message: "unknown tool".into(),
        })?;
        let action = kind.parse(input)?;
        action.execute(&self.context).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_gid_selector() {
        assert_eq!(gid_selector("button", 42), r#"button[gid="42"]"#);
    }

    #[test]
    fn test_js_string_escapes() {
        assert_eq!(
            js_string(r#"a[gid="1"]"#).unwrap(),
            r#""a[gid=\"1\"]""#
        );
    }
}
