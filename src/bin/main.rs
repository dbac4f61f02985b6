use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};
use pagepilot::dom::{self, Document, ReduceConfig};
use pagepilot::llm::OpenAiPlanner;
use pagepilot::tokens::TokenCounter;
use pagepilot::{Params, Runner, TaskConfig, UNIQUE_ID_ATTRIBUTE};
use tracing::Level;
use tracing_subscriber::FmtSubscriber;

#[derive(Parser)]
#[command(name = "pagepilot")]
#[command(about = "Drive a browser from natural-language instructions")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Verbose output (-v for info, -vv for debug)
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Quiet mode (only errors)
    #[arg(short, long, global = true)]
    quiet: bool,
}

#[derive(Subcommand)]
enum Command {
    /// Run a task in the browser
    Run(RunArgs),

    /// Reduce a saved HTML file the way pages are reduced for the model
    Shrink {
        /// HTML file to reduce
        file: PathBuf,

        /// Stamp identifiers on elements first
        #[arg(long)]
        tag: bool,

        /// Clip the result to this many tokens
        #[arg(long, value_name = "N")]
        max_tokens: Option<usize>,
    },

    /// Validate a task file without running it
    Check {
        /// Task file to check
        config: PathBuf,

        /// Set a parameter (can be used multiple times)
        #[arg(short = 'P', long = "param", value_name = "KEY=VALUE")]
        params: Vec<String>,
    },
}

#[derive(Args)]
struct RunArgs {
    /// Task file to run
    #[arg(long, short)]
    config: Option<PathBuf>,

    /// Instructions (override the task file's)
    #[arg(long, short)]
    instructions: Option<String>,

    /// Page to open first
    #[arg(long)]
    start_url: Option<String>,

    /// Run in headless mode (overrides config)
    #[arg(long)]
    headless: bool,

    /// Model name (overrides config)
    #[arg(long)]
    model: Option<String>,

    /// Iteration limit (overrides config)
    #[arg(long, value_name = "N")]
    max_iterations: Option<usize>,

    /// Set a parameter (can be used multiple times)
    #[arg(short = 'P', long = "param", value_name = "KEY=VALUE")]
    params: Vec<String>,

    /// Print every step after the answer
    #[arg(long)]
    steps: bool,
}

#[tokio::main]
async fn main() -> pagepilot::Result<()> {
    let cli = Cli::parse();

    let level = if cli.quiet {
        Level::ERROR
    } else {
        match cli.verbose {
            0 => Level::WARN,
            1 => Level::INFO,
            _ => Level::DEBUG,
        }
    };

    FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(false)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .compact()
        .init();

    match cli.command {
        Command::Run(args) => run(args).await,
        Command::Shrink {
            file,
            tag,
            max_tokens,
        } => shrink(file, tag, max_tokens),
        Command::Check { config, params } => check(config, &params),
    }
}

async fn run(args: RunArgs) -> pagepilot::Result<()> {
    let params = Params::from_args(&args.params)?;
    let mut config = match (&args.config, &args.instructions) {
        (Some(path), _) => TaskConfig::load_with_params(path, &params)?,
        (None, Some(instructions)) => TaskConfig::inline(instructions.clone(), None)?,
        (None, None) => {
            return Err(pagepilot::Error::Config(
                "either --config or --instructions is required".into(),
            ))
        }
    };

    if let Some(instructions) = args.instructions {
        config.instructions = instructions;
    }
    if args.start_url.is_some() {
        config.start_url = args.start_url;
    }
    if args.headless {
        config.browser.headless = true;
    }
    if let Some(model) = args.model {
        config.model.name = model;
    }
    if let Some(max) = args.max_iterations {
        config.agent.max_iterations = max;
    }
    if args.steps {
        config.agent.return_intermediate_steps = true;
    }
    config.validate()?;

    let planner =
        OpenAiPlanner::from_config(&config.model, pagepilot::actions::tool_definitions())?;

    println!("Running: {}", config.name);
    let runner = Runner::new(&config.browser).await?;
    let output = runner.run_to_completion(&config, &planner).await?;

    println!();
    match output.output() {
        Some(answer) => println!("{}", answer),
        None => println!("{}", serde_json::to_string_pretty(&output.return_values)?),
    }
    if let Some(ref steps) = output.intermediate_steps {
        println!();
        for (i, step) in steps.iter().enumerate() {
            println!("  {}. {} {}", i + 1, step.action.tool, step.action.input);
            println!("     -> {}", step.observation);
        }
    }

    let usage = planner.usage();
    println!();
    println!("  Status: {:?}", output.status);
    println!("  Iterations: {}", output.iterations);
    println!(
        "  Model calls: {} ({} tokens, ${:.4})",
        usage.calls,
        usage.total_tokens(),
        usage.cost_usd
    );
    Ok(())
}

fn shrink(file: PathBuf, tag: bool, max_tokens: Option<usize>) -> pagepilot::Result<()> {
    let html = std::fs::read_to_string(&file)?;
    let mut document = Document::parse(&html);
    if tag {
        let tagged = dom::tag_document(&mut document, UNIQUE_ID_ATTRIBUTE);
        tracing::info!("Tagged {} elements", tagged);
    }
    let reduced = dom::reduce_to_html(&document, &ReduceConfig::default());

    match max_tokens {
        Some(max) => {
            let counter = TokenCounter::new()?;
            println!("{}", counter.clip(&reduced, max));
        }
        None => println!("{}", reduced),
    }
    Ok(())
}

fn check(path: PathBuf, params: &[String]) -> pagepilot::Result<()> {
    let params = Params::from_args(params)?;
    let config = TaskConfig::load_with_params(&path, &params)?;

    println!("Config valid: {}", config.name);
    if let Some(ref start_url) = config.start_url {
        println!("  Start URL: {}", start_url);
    }
    println!("  Instructions: {}", config.instructions);
    println!("  Model: {}", config.model.name);
    println!("  Max iterations: {}", config.agent.max_iterations);
    println!("  Observation budget: {} tokens", config.observation.max_tokens);
    if !config.params.is_empty() {
        println!("  Parameters: {}", config.params.len());
        for (name, def) in &config.params {
            let req = if def.required { " (required)" } else { "" };
            let desc = def.description.as_deref().unwrap_or("");
            println!("    - {}{}: {}", name, req, desc);
        }
    }
    Ok(())
}
