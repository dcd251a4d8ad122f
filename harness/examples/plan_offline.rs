//! Plan a small suite offline with the deterministic packer and print
//! the resulting batches.
//!
//! Run with: cargo run -p harness --example plan_offline

use harness::{Planner, SessionProfile, TestCase, TestCaseProfile};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cases = vec![
        TestCase::new("greeting", "say hello", "greets back"),
        TestCase::new("hours", "ask opening hours", "states hours"),
        TestCase::new("booking", "book an appointment", "confirms a slot"),
        TestCase::new("reschedule", "move the appointment", "offers new slots"),
        TestCase::new("goodbye", "say goodbye", "ends the call politely"),
    ];

    let mut profiles: Vec<TestCaseProfile> =
        cases.iter().map(TestCaseProfile::conservative).collect();
    profiles[4].must_be_last = true;
    profiles[4].end_session_probability = 95;

    let plan = Planner::deterministic()
        .plan(&cases, &profiles, &SessionProfile::default(), 3)
        .await?;

    println!("{}", plan.strategy_summary);
    for batch in &plan.batches {
        println!("\n{} ({}, ~{}s)", batch.name, batch.modality, batch.estimated_duration_secs);
        for id in &batch.test_case_ids {
            let case = cases.iter().find(|c| c.id == *id).unwrap();
            println!("  - {}", case.name);
        }
    }

    Ok(())
}
