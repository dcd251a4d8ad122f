use clap::{Parser, Subcommand};
use harness::{Plan, Planner, SessionProfile, TestCase, TestCaseProfile};
use std::path::PathBuf;
use tracing::info;

#[derive(Parser)]
#[command(name = "parley")]
#[command(about = "Behavioral test harness for conversational AI agents")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Plan batches for a test-case file using the deterministic packer
    /// (no oracle involved; useful for offline inspection)
    Plan {
        /// Path to a JSON array of test cases
        #[arg(short, long)]
        cases: PathBuf,
        /// Maximum test cases per batch
        #[arg(short, long, default_value = "5")]
        max_per_batch: usize,
    },
    /// Check a plan file against its test-case file: coverage,
    /// duplicates, and batch size caps
    Validate {
        /// Path to a plan JSON produced by `plan`
        #[arg(short, long)]
        plan: PathBuf,
        /// Path to the JSON array of test cases the plan was built from
        #[arg(short, long)]
        cases: PathBuf,
        /// Maximum test cases per batch
        #[arg(short, long, default_value = "5")]
        max_per_batch: usize,
    },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Plan {
            cases,
            max_per_batch,
        } => {
            let cases: Vec<TestCase> = serde_json::from_str(&std::fs::read_to_string(cases)?)?;
            let profiles: Vec<TestCaseProfile> =
                cases.iter().map(TestCaseProfile::conservative).collect();

            let plan = Planner::deterministic()
                .plan(&cases, &profiles, &SessionProfile::default(), max_per_batch)
                .await?;

            info!("{}", plan.strategy_summary);
            println!("{}", serde_json::to_string_pretty(&plan)?);
        }
        Commands::Validate {
            plan,
            cases,
            max_per_batch,
        } => {
            let plan: Plan = serde_json::from_str(&std::fs::read_to_string(plan)?)?;
            let cases: Vec<TestCase> = serde_json::from_str(&std::fs::read_to_string(cases)?)?;

            let problems = validate_plan(&plan, &cases, max_per_batch);
            if problems.is_empty() {
                println!(
                    "Plan OK: {} batches, {} test cases covered",
                    plan.coverage.batch_count, plan.coverage.planned_count
                );
            } else {
                for problem in &problems {
                    eprintln!("Problem: {problem}");
                }
                std::process::exit(1);
            }
        }
    }

    Ok(())
}

fn validate_plan(plan: &Plan, cases: &[TestCase], max_per_batch: usize) -> Vec<String> {
    use std::collections::HashSet;

    let mut problems = Vec::new();

    let planned = plan.all_test_case_ids();
    let mut seen = HashSet::new();
    for id in &planned {
        if !seen.insert(*id) {
            problems.push(format!("test case {id} appears in more than one batch"));
        }
    }

    let expected: HashSet<_> = cases.iter().map(|c| c.id).collect();
    for id in expected.difference(&seen) {
        problems.push(format!("test case {id} is not covered by any batch"));
    }
    for id in seen.difference(&expected) {
        problems.push(format!("batch references unknown test case {id}"));
    }

    for batch in &plan.batches {
        if batch.test_case_ids.len() > max_per_batch {
            problems.push(format!(
                "batch '{}' holds {} cases (cap {max_per_batch})",
                batch.name,
                batch.test_case_ids.len()
            ));
        }
        if batch.test_case_ids.is_empty() {
            problems.push(format!("batch '{}' is empty", batch.name));
        }
    }

    problems
}
