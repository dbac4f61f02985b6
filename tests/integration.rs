//! Integration tests for pagepilot
//!
//! Browser tests require Chrome to be installed and available.
//! Run with: cargo test --test integration -- --ignored

use std::cell::RefCell;
use std::collections::VecDeque;

use async_trait::async_trait;
use pagepilot::actions::{BrowserToolbox, PageObserver};
use pagepilot::agent::{
    ActionCall, AgentExecutor, AgentStep, Decision, Finish, Planner, RunStatus, Toolbox,
};
use pagepilot::dom::{self, Document, ReduceConfig};
use pagepilot::store::FsStore;
use pagepilot::{BrowserConfig, ObservationConfig, Runner, UNIQUE_ID_ATTRIBUTE};
use serde_json::{json, Value};

/// Check if Chrome is available
fn chrome_available() -> bool {
    eoka::stealth::patcher::find_chrome().is_ok()
}

async fn launch() -> Runner {
    Runner::new(&BrowserConfig::default())
        .await
        .expect("Failed to launch browser")
}

fn observer() -> PageObserver {
    PageObserver::from_config(&ObservationConfig::default()).expect("Failed to load tokenizer")
}

async fn gid_of(runner: &Runner, selector: &str) -> u64 {
    let js = format!(
        "Number(document.querySelector({}).getAttribute('gid'))",
        serde_json::to_string(selector).unwrap()
    );
    runner.page().evaluate(&js).await.expect("Failed to read gid")
}

const SHOP_PAGE: &str = r##"data:text/html,
    <html><body>
      <nav><a href="https://example.com/"><span><b>Home</b></span></a></nav>
      <h1 id="title">Rust Shop</h1>
      <div class="card"><p id="price">12 EUR</p>
        <button id="buy" onclick="document.getElementById('status').textContent = 'Added to cart'">
          <i>Add to cart</i>
        </button>
      </div>
      <p id="status">Empty cart</p>
      <form id="search" onsubmit="event.preventDefault(); document.getElementById('status').textContent = 'Searched ' + document.getElementById('q').value">
        <input id="q" type="text" name="q">
        <button type="submit">Search</button>
      </form>
    </body></html>
"##;

#[tokio::test]
#[ignore = "requires Chrome"]
async fn test_tagging_is_stable() {
    if !chrome_available() {
        eprintln!("Chrome not found, skipping test");
        return;
    }

    let runner = launch().await;
    runner.page().goto(SHOP_PAGE).await.expect("Failed to navigate");

    dom::tag_all_elements(runner.page(), UNIQUE_ID_ATTRIBUTE)
        .await
        .expect("Failed to tag");
    let price = gid_of(&runner, "#price").await;
    let buy = gid_of(&runner, "#buy").await;
    assert!(price > 0);
    assert_ne!(price, buy);

    // A new element before #price must not shift existing identifiers.
    runner
        .page()
        .execute(
            "const n = document.createElement('p'); n.id = 'fresh'; \
             document.getElementById('price').before(n);",
        )
        .await
        .expect("Failed to insert element");
    dom::tag_all_elements(runner.page(), UNIQUE_ID_ATTRIBUTE)
        .await
        .expect("Failed to re-tag");

    assert_eq!(gid_of(&runner, "#price").await, price);
    assert_eq!(gid_of(&runner, "#buy").await, buy);
    let fresh = gid_of(&runner, "#fresh").await;
    assert!(fresh > 0);
    assert_ne!(fresh, price);
    assert_ne!(fresh, buy);

    runner.close().await.expect("Failed to close browser");
}

#[tokio::test]
#[ignore = "requires Chrome"]
async fn test_actions_against_live_page() {
    if !chrome_available() {
        eprintln!("Chrome not found, skipping test");
        return;
    }

    let dir = tempfile::tempdir().unwrap();
    let store = FsStore::open(dir.path()).unwrap();
    let observer = observer();
    let runner = launch().await;
    let toolbox = BrowserToolbox::new(runner.page(), &observer, &store);

    let observation = toolbox
        .invoke("go_to_url", &json!({ "url": SHOP_PAGE }))
        .await
        .expect("go_to_url failed");
    assert!(
        observation.starts_with("Previous action was: go_to_url, Current page content: <"),
        "observation: {}",
        observation
    );
    assert!(observation.contains("gid="), "observation: {}", observation);
    // Label text survives even though <i> and <b> are not kept.
    assert!(observation.contains("Add to cart"), "observation: {}", observation);
    assert!(observation.contains("Home"), "observation: {}", observation);
    assert!(!observation.contains("onclick"), "observation: {}", observation);

    let buy = gid_of(&runner, "#buy").await;
    let observation = toolbox
        .invoke("click_element", &json!({ "gid": buy, "tagName": "button" }))
        .await
        .expect("click_element failed");
    assert!(observation.contains("Added to cart"), "observation: {}", observation);

    let missing = toolbox
        .invoke("click_element", &json!({ "gid": 99999, "text": "No such thing" }))
        .await
        .unwrap_err();
    assert!(missing.is_tool_input());

    let input = gid_of(&runner, "#q").await;
    let observation = toolbox
        .invoke(
            "fill_form_and_submit",
            &json!({ "formData": [{ "gid": input, "value": "  tokio  " }] }),
        )
        .await
        .expect("fill_form_and_submit failed");
    assert!(observation.contains("Searched tokio"), "observation: {}", observation);

    let title = gid_of(&runner, "#title").await;
    let price = gid_of(&runner, "#price").await;
    let observation = toolbox
        .invoke(
            "extract_data",
            &json!({ "attributesToExtract": [
                { "gid": title, "keyName": "title" },
                { "gid": price, "keyName": "price" }
            ]}),
        )
        .await
        .expect("extract_data failed");
    let payload = observation
        .strip_prefix("Extracted JSON data from page: ")
        .expect("unexpected extract observation");
    let data: Value = serde_json::from_str(payload).unwrap();
    assert_eq!(data, json!({ "title": "Rust Shop", "price": "12 EUR" }));

    let saved = toolbox
        .invoke(
            "capture_and_save_screenshot",
            &json!({ "filename": "shop", "saveHtml": true }),
        )
        .await
        .expect("capture_and_save_screenshot failed");
    assert_eq!(saved, "Screenshot saved");
    assert!(dir.path().join("key_value_store/shop.png").exists());
    assert!(dir.path().join("key_value_store/shop.html").exists());

    runner.close().await.expect("Failed to close browser");
}

/// Replays a fixed list of decisions.
struct ScriptedPlanner {
    decisions: RefCell<VecDeque<Decision>>,
    seen: RefCell<Vec<Vec<AgentStep>>>,
}

impl ScriptedPlanner {
    fn new(decisions: Vec<Decision>) -> Self {
        Self {
            decisions: RefCell::new(decisions.into()),
            seen: RefCell::new(Vec::new()),
        }
    }
}

#[async_trait(?Send)]
impl Planner for ScriptedPlanner {
    async fn plan(&self, _instructions: &str, steps: &[AgentStep]) -> pagepilot::Result<Decision> {
        self.seen.borrow_mut().push(steps.to_vec());
        Ok(self
            .decisions
            .borrow_mut()
            .pop_front()
            .unwrap_or_else(|| Decision::Finish(Finish::new("out of script"))))
    }
}

#[tokio::test]
#[ignore = "requires Chrome"]
async fn test_agent_run_saves_output() {
    if !chrome_available() {
        eprintln!("Chrome not found, skipping test");
        return;
    }

    let dir = tempfile::tempdir().unwrap();
    let store = FsStore::open(dir.path()).unwrap();
    let observer = observer();
    let runner = launch().await;
    let toolbox = BrowserToolbox::new(runner.page(), &observer, &store);

    let planner = ScriptedPlanner::new(vec![
        Decision::Act(vec![ActionCall::new("go_to_url", json!({ "url": SHOP_PAGE }))]),
        Decision::Act(vec![ActionCall::new(
            "save_object_to_output",
            json!({ "object": [{ "key": "title", "value": "Rust Shop" }] }),
        )]),
        Decision::Finish(Finish::new("Saved the title")),
    ]);
    let executor = AgentExecutor::new(&planner, &toolbox)
        .return_intermediate_steps(true)
        .rewrite_previous_step(PageObserver::redact_previous_page());

    let output = executor.run("Save the shop title").await.expect("run failed");
    assert_eq!(output.status, RunStatus::Finished);
    assert_eq!(output.output(), Some("Saved the title"));
    assert_eq!(output.iterations, 2);

    // The page snapshot is dropped once a newer step exists.
    let seen = planner.seen.borrow();
    assert!(seen[1][0].observation.contains("<html"));
    assert!(seen[2][0]
        .observation
        .ends_with("Current page content: [content of the previous page omitted]"));
    assert_eq!(seen[2][1].observation, "Output saved");

    let raw = std::fs::read_to_string(dir.path().join("key_value_store/OUTPUT.json")).unwrap();
    let saved: Value = serde_json::from_str(&raw).unwrap();
    assert_eq!(saved, json!({ "title": "Rust Shop" }));

    runner.close().await.expect("Failed to close browser");
}

#[test]
fn test_offline_tag_and_shrink() {
    let html = r#"<html lang="en"><head><title>Shop</title><script>var x = 1;</script></head>
        <body><div class="wrap"><a href="/cart"><span><i>Cart</i></span></a>
        <!-- promo --><p style="color:red">Price:   12 EUR</p></div></body></html>"#;
    let mut document = Document::parse(html);
    let tagged = dom::tag_document(&mut document, UNIQUE_ID_ATTRIBUTE);
    assert!(tagged > 5);

    let reduced = dom::reduce_to_html(&document, &ReduceConfig::default());
    // head=1 is dropped, body=4 and the anchor=6 are kept.
    assert!(!reduced.contains("gid=\"1\""), "reduced: {}", reduced);
    assert!(reduced.contains("gid=\"4\""), "reduced: {}", reduced);
    assert!(reduced.contains("gid=\"6\""), "reduced: {}", reduced);
    assert!(reduced.contains("href=\"/cart\""), "reduced: {}", reduced);
    assert!(reduced.contains("Cart"), "reduced: {}", reduced);
    assert!(reduced.contains("Price: 12 EUR"), "reduced: {}", reduced);
    assert!(!reduced.contains("script"), "reduced: {}", reduced);
    assert!(!reduced.contains("promo"), "reduced: {}", reduced);
    assert!(!reduced.contains("style"), "reduced: {}", reduced);
    assert!(!reduced.contains("class"), "reduced: {}", reduced);

    // Reducing again changes nothing.
    assert_eq!(dom::reduce_html(&reduced, &ReduceConfig::default()), reduced);
}
