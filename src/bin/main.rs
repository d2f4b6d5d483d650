use procurement_assistant::{
    agent::{AssistantCore, QUICK_QUESTIONS},
    config::AppConfig,
    format::{format_count, format_currency},
};
use std::io::Write;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

const HELP: &str = "Commands: 'overview', 'examples', 'reset', 'exit'. Anything else is a question.";

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .init();

    let demo = std::env::args().skip(1).any(|arg| arg == "--demo");

    let config = AppConfig::from_env()?;
    let core = AssistantCore::from_config(config).await?;
    let mut session = core.session();

    info!("Procurement Assistant starting");

    if demo {
        for (label, question) in QUICK_QUESTIONS {
            println!("\n=== {} ===\n> {}", label, question);
            let report = session.ask(question).await;
            println!("{}", report.answer);
            println!("[{} | {} tool call(s)]", report.termination, report.tool_calls);
        }
        core.shutdown().await?;
        return Ok(());
    }

    println!("California Procurement Assistant");
    println!("{}", HELP);

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        print!("\n> ");
        std::io::stdout().flush()?;

        let Some(line) = lines.next_line().await? else {
            break;
        };
        let input = line.trim();

        match input {
            "" => continue,
            "exit" | "quit" => break,
            "help" => println!("{}", HELP),
            "reset" => {
                session.reset_conversation();
                println!("Conversation cleared.");
            }
            "examples" => {
                for (label, question) in QUICK_QUESTIONS {
                    println!("- {}: {}", label, question);
                }
            }
            "overview" => match core.explorer().overview().await {
                Ok(overview) => {
                    println!("Records: {}", format_count(overview.total_records));
                    println!(
                        "Fiscal years: {}",
                        overview
                            .fiscal_years
                            .iter()
                            .filter_map(|v| v.as_str())
                            .collect::<Vec<_>>()
                            .join(", ")
                    );
                    println!("Departments: {}", format_count(overview.department_count as u64));
                    println!("Suppliers: {}", format_count(overview.supplier_count as u64));
                    println!("Total valid spending: {}", format_currency(overview.total_spending));
                }
                Err(e) => {
                    warn!(error = %e, "Overview failed");
                    println!("Could not load the overview: {}", e);
                }
            },
            question => {
                let answer = session.answer_question(question).await;
                println!("{}", answer);
            }
        }
    }

    core.shutdown().await?;
    Ok(())
}
