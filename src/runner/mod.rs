use eoka::{Browser, Page};
use tracing::{debug, info, info_span, warn, Instrument};

use crate::actions::{BrowserToolbox, PageObserver};
use crate::agent::{AgentExecutor, Planner, RunOutput};
use crate::config::{BrowserConfig, TaskConfig};
use crate::store::FsStore;
use crate::{Error, Result};

/// Owns the browser a task runs in.
pub struct Runner {
    browser: Browser,
    page: Page,
}

impl Runner {
    /// Launch a browser with one blank page.
    pub async fn new(config: &BrowserConfig) -> Result<Self> {
        let viewport = config.viewport.unwrap_or_default();
        let stealth = eoka::StealthConfig {
            headless: config.headless,
            proxy: config.proxy.clone(),
            user_agent: config.user_agent.clone(),
            viewport_width: viewport.width,
            viewport_height: viewport.height,
            ..Default::default()
        };

        debug!(
            "Launching browser (headless: {}, proxy: {:?})",
            config.headless, config.proxy
        );
        let browser = Browser::launch_with_config(stealth).await?;
        let page = browser.new_page("about:blank").await?;

        Ok(Self { browser, page })
    }

    pub fn page(&self) -> &Page {
        &self.page
    }

    /// Run a task against this browser's page.
    pub async fn run(&self, config: &TaskConfig, planner: &dyn Planner) -> Result<RunOutput> {
        let span = info_span!("web_agent", task = %config.name);
        async {
            let store = FsStore::open(&config.storage.dir)?;
            let observer = PageObserver::from_config(&config.observation)?;
            let toolbox = BrowserToolbox::new(&self.page, &observer, &store);

            let mut executor = AgentExecutor::new(planner, &toolbox)
                .max_iterations(config.agent.max_iterations)
                .early_stopping(config.agent.early_stopping)
                .handle_parsing_errors(config.agent.parsing_error_policy())
                .return_intermediate_steps(config.agent.return_intermediate_steps);
            if config.agent.redact_previous_page {
                executor = executor.rewrite_previous_step(PageObserver::redact_previous_page());
            }

            let instructions = config.effective_instructions();
            info!(instructions = %instructions, "Starting");
            let output = executor.run(&instructions).await?;
            info!(
                status = ?output.status,
                iterations = output.iterations,
                storage = %store.root().display(),
                "Run complete"
            );
            Ok::<_, Error>(output)
        }
        .instrument(span)
        .await
    }

    /// Run a task, then close the browser whether or not the run succeeded.
    pub async fn run_to_completion(
        self,
        config: &TaskConfig,
        planner: &dyn Planner,
    ) -> Result<RunOutput> {
        let result = self.run(config, planner).await;
        if let Err(e) = self.close().await {
            warn!("Failed to close browser: {}", e);
        }
        result
    }

    pub async fn close(self) -> Result<()> {
        self.browser.close().await?;
        Ok(())
    }
}
